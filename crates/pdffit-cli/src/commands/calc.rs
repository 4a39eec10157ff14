use crate::cli::CalcArgs;
use crate::error::{CliError, Result};
use pdffit::workflows::fit::PdfFit;
use tracing::info;

pub fn run(args: CalcArgs) -> Result<()> {
    let mut fit = PdfFit::new();
    info!("Loading structure from {:?}", &args.structure);
    fit.read_struct(&args.structure)
        .map_err(|e| CliError::FileParsing {
            path: args.structure.clone(),
            source: e.into(),
        })?;

    let iset = fit.alloc(
        args.stype,
        args.qmax,
        args.qsig,
        args.rmin,
        args.rmax,
        args.bins,
    )?;
    fit.calc()?;
    info!(points = args.bins, "PDF calculated.");

    match &args.output {
        Some(path) => {
            fit.save_pdf(iset, path)?;
            println!("Calculated PDF written to: {}", path.display());
        }
        None => print!("{}", fit.save_pdf_string(iset)?),
    }
    Ok(())
}
