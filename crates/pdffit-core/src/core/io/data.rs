use crate::core::io::traits::ModelFile;
use std::io::{self, BufRead, Write};
use thiserror::Error;

/// Columns of a PDF data file. `dg` is empty when the file has no
/// uncertainty column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataColumns {
    pub r: Vec<f64>,
    pub g: Vec<f64>,
    pub dg: Vec<f64>,
}

impl DataColumns {
    pub fn len(&self) -> usize {
        self.r.len()
    }

    pub fn is_empty(&self) -> bool {
        self.r.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error on line {line}: {kind}")]
    Parse { line: usize, kind: DataParseErrorKind },
    #[error("Data file contains no data points")]
    Empty,
}

#[derive(Debug, Error, PartialEq)]
pub enum DataParseErrorKind {
    #[error("Invalid float in column {column} (value: '{value}')")]
    InvalidFloat { column: usize, value: String },
    #[error("Expected 2 to 4 columns, found {found}")]
    WrongColumnCount { found: usize },
    #[error("Expected {expected} columns like the first data line, found {found}")]
    InconsistentColumns { expected: usize, found: usize },
}

/// Whitespace-separated columns `r G`, `r G dG` or `r G dr dG`. Lines
/// starting with `#` are comments and are returned as metadata.
pub struct DataFile;

impl DataFile {
    fn parse_row(line: &str) -> Result<Vec<f64>, DataParseErrorKind> {
        line.split_whitespace()
            .enumerate()
            .map(|(i, field)| {
                field
                    .parse::<f64>()
                    .map_err(|_| DataParseErrorKind::InvalidFloat {
                        column: i + 1,
                        value: field.to_string(),
                    })
            })
            .collect()
    }
}

impl ModelFile for DataFile {
    type Model = DataColumns;
    type Metadata = Vec<String>;
    type Error = DataError;

    fn read_from(reader: &mut impl BufRead) -> Result<(DataColumns, Vec<String>), DataError> {
        let mut columns = DataColumns::default();
        let mut comments = Vec::new();
        let mut width: Option<usize> = None;

        for (line_num, line_res) in reader.lines().enumerate() {
            let line = line_res?;
            let line_num = line_num + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(comment) = trimmed.strip_prefix('#') {
                comments.push(comment.trim().to_string());
                continue;
            }

            let row = Self::parse_row(trimmed).map_err(|kind| DataError::Parse {
                line: line_num,
                kind,
            })?;
            match width {
                None if !(2..=4).contains(&row.len()) => {
                    return Err(DataError::Parse {
                        line: line_num,
                        kind: DataParseErrorKind::WrongColumnCount { found: row.len() },
                    });
                }
                None => width = Some(row.len()),
                Some(expected) if expected != row.len() => {
                    return Err(DataError::Parse {
                        line: line_num,
                        kind: DataParseErrorKind::InconsistentColumns {
                            expected,
                            found: row.len(),
                        },
                    });
                }
                Some(_) => {}
            }

            columns.r.push(row[0]);
            columns.g.push(row[1]);
            match row.len() {
                3 => columns.dg.push(row[2]),
                4 => columns.dg.push(row[3]),
                _ => {}
            }
        }

        if columns.is_empty() {
            return Err(DataError::Empty);
        }
        Ok((columns, comments))
    }

    fn write_to(
        columns: &DataColumns,
        comments: &Vec<String>,
        writer: &mut impl Write,
    ) -> Result<(), DataError> {
        for comment in comments {
            writeln!(writer, "# {}", comment)?;
        }
        let with_dg = columns.dg.len() == columns.r.len() && columns.dg.iter().any(|&v| v != 0.0);
        for (i, (r, g)) in columns.r.iter().zip(&columns.g).enumerate() {
            if with_dg {
                writeln!(writer, "{:12.6} {:16.8e} {:16.8e}", r, g, columns.dg[i])?;
            } else {
                writeln!(writer, "{:12.6} {:16.8e}", r, g)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_two_column_data_with_comments() {
        let text = "# Ni at 300K\n# qmax = 26\n\n1.00 0.5\n1.01 -0.25\n";
        let (columns, comments) = DataFile::read_from_str(text).unwrap();
        assert_eq!(columns.r, vec![1.0, 1.01]);
        assert_eq!(columns.g, vec![0.5, -0.25]);
        assert!(columns.dg.is_empty());
        assert_eq!(comments, vec!["Ni at 300K", "qmax = 26"]);
    }

    #[test]
    fn uncertainty_is_the_last_column() {
        let (three, _) = DataFile::read_from_str("1 2 0.1\n2 3 0.2\n").unwrap();
        assert_eq!(three.dg, vec![0.1, 0.2]);
        let (four, _) = DataFile::read_from_str("1 2 0.01 0.1\n2 3 0.01 0.2\n").unwrap();
        assert_eq!(four.dg, vec![0.1, 0.2]);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = DataFile::read_from_str("# header\n1 2\n2 x\n").unwrap_err();
        match err {
            DataError::Parse { line, kind } => {
                assert_eq!(line, 3);
                assert_eq!(
                    kind,
                    DataParseErrorKind::InvalidFloat {
                        column: 2,
                        value: "x".into()
                    }
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = DataFile::read_from_str("1 2\n2 3 4\n").unwrap_err();
        assert!(matches!(
            err,
            DataError::Parse {
                line: 2,
                kind: DataParseErrorKind::InconsistentColumns { expected: 2, found: 3 }
            }
        ));

        let err = DataFile::read_from_str("1\n").unwrap_err();
        assert!(matches!(
            err,
            DataError::Parse {
                line: 1,
                kind: DataParseErrorKind::WrongColumnCount { found: 1 }
            }
        ));
    }

    #[test]
    fn empty_files_are_rejected() {
        assert!(matches!(
            DataFile::read_from_str("# only a comment\n"),
            Err(DataError::Empty)
        ));
    }

    #[test]
    fn written_columns_parse_back() {
        let columns = DataColumns {
            r: vec![1.0, 1.5],
            g: vec![0.25, -1.0e-3],
            dg: vec![0.01, 0.02],
        };
        let text = DataFile::write_to_string(&columns, &vec!["calc".to_string()]).unwrap();
        assert!(text.starts_with("# calc\n"));
        let (again, comments) = DataFile::read_from_str(&text).unwrap();
        assert_eq!(comments, vec!["calc"]);
        assert_eq!(again.dg.len(), 2);
        for (a, b) in again.g.iter().zip(&columns.g) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
