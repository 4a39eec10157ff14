use std::error::Error;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Cursor, Write};
use std::path::Path;

/// Defines the interface for reading and writing one of the text formats
/// the fitting session exchanges with the outside world.
///
/// Implementors handle format-specific parsing and serialization of a
/// [`ModelFile::Model`] plus whatever side information the format carries
/// ([`ModelFile::Metadata`]).
pub trait ModelFile {
    /// The in-memory value the format describes.
    type Model;

    /// Side information carried next to the model.
    type Metadata;

    /// The error type for I/O operations.
    type Error: Error + From<io::Error>;

    /// Reads a model from a buffered reader.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing fails or I/O operations encounter issues.
    fn read_from(reader: &mut impl BufRead) -> Result<(Self::Model, Self::Metadata), Self::Error>;

    /// Writes a model and its metadata to a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_to(
        model: &Self::Model,
        metadata: &Self::Metadata,
        writer: &mut impl Write,
    ) -> Result<(), Self::Error>;

    /// Reads a model from in-memory text.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing fails.
    fn read_from_str(text: &str) -> Result<(Self::Model, Self::Metadata), Self::Error> {
        let mut reader = Cursor::new(text.as_bytes());
        Self::read_from(&mut reader)
    }

    /// Renders a model and its metadata as text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn write_to_string(model: &Self::Model, metadata: &Self::Metadata) -> Result<String, Self::Error> {
        let mut buffer = Vec::new();
        Self::write_to(model, metadata, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Reads a model from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or parsing fails.
    fn read_from_path<P: AsRef<Path>>(
        path: P,
    ) -> Result<(Self::Model, Self::Metadata), Self::Error> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::read_from(&mut reader)
    }

    /// Writes a model and its metadata to a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or writing fails.
    fn write_to_path<P: AsRef<Path>>(
        model: &Self::Model,
        metadata: &Self::Metadata,
        path: P,
    ) -> Result<(), Self::Error> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        Self::write_to(model, metadata, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}
