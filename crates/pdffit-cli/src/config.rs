use crate::cli::FitArgs;
use crate::error::{CliError, Result};
use pdffit::core::scattering::ScatteringType;
use pdffit::engine::config::{DEFAULT_TOLERANCE, validate_tolerance};
use pdffit::engine::constraints::{ConstraintMode, ConstraintTarget};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A structure to load, relative to the fit script.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StructureEntry {
    pub path: PathBuf,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DataEntry {
    pub path: PathBuf,
    pub stype: ScatteringType,
    #[serde(default)]
    pub qmax: f64,
    #[serde(default)]
    pub qsig: f64,
    pub fit_range: Option<[f64; 2]>,
}

/// `target` is either a parameter slot (`1`) or a formula (`"0.5 + @1"`).
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum TargetEntry {
    Slot(usize),
    Formula(String),
}

impl From<TargetEntry> for ConstraintTarget {
    fn from(t: TargetEntry) -> Self {
        match t {
            TargetEntry::Slot(n) => ConstraintTarget::Slot(n),
            TargetEntry::Formula(f) => ConstraintTarget::Formula(f),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConstraintEntry {
    pub variable: String,
    pub target: TargetEntry,
    pub mode: Option<String>,
    /// Phase the variable belongs to; defaults to the last loaded.
    pub phase: Option<usize>,
    /// Dataset for dataset-scoped variables; defaults to the last loaded.
    pub dataset: Option<usize>,
}

impl ConstraintEntry {
    pub fn mode(&self) -> Result<Option<ConstraintMode>> {
        self.mode
            .as_deref()
            .map(str::parse::<ConstraintMode>)
            .transpose()
            .map_err(CliError::from)
    }
}

/// A number, or a variable reference such as `"lat(1)"`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ParameterValue {
    Number(f64),
    Reference(String),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ParameterEntry {
    pub slot: usize,
    pub value: ParameterValue,
    #[serde(default)]
    pub fixed: bool,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PartialOutputConfig {
    dir: Option<PathBuf>,
    pdf: Option<bool>,
    dif: Option<bool>,
    res: Option<bool>,
    structures: Option<bool>,
}

/// Which result files to write, and where.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPlan {
    pub dir: Option<PathBuf>,
    pub pdf: bool,
    pub dif: bool,
    pub res: bool,
    pub structures: bool,
}

/// Fit script as read from disk, before CLI overrides.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialFitConfig {
    tolerance: Option<f64>,
    #[serde(default)]
    structure: Vec<StructureEntry>,
    #[serde(default)]
    data: Vec<DataEntry>,
    #[serde(default)]
    constraint: Vec<ConstraintEntry>,
    #[serde(default)]
    parameter: Vec<ParameterEntry>,
    output: Option<PartialOutputConfig>,
    #[serde(skip)]
    base_dir: PathBuf,
}

/// Everything `pdffit fit` needs, with paths resolved and overrides applied.
#[derive(Debug, Clone, PartialEq)]
pub struct FitPlan {
    pub structures: Vec<PathBuf>,
    pub data: Vec<DataEntry>,
    pub constraints: Vec<ConstraintEntry>,
    pub parameters: Vec<ParameterEntry>,
    pub tolerance: f64,
    pub output: OutputPlan,
    pub progress: bool,
}

impl PartialFitConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading fit script from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    pub fn merge_with_cli(mut self, args: &FitArgs) -> Result<FitPlan> {
        self.apply_set_values(&args.set_values)?;

        if self.structure.is_empty() {
            return Err(CliError::Config(
                "At least one `[[structure]]` entry is required.".to_string(),
            ));
        }
        if self.data.is_empty() {
            return Err(CliError::Config(
                "At least one `[[data]]` entry is required.".to_string(),
            ));
        }

        let tolerance = validate_tolerance(
            args.tolerance
                .or(self.tolerance)
                .unwrap_or(DEFAULT_TOLERANCE),
        )
        .map_err(|e| CliError::Config(e.to_string()))?;

        let base = self.base_dir.clone();
        let resolve = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { base.join(p) };

        let output = self.output.take().unwrap_or_default();
        let output = OutputPlan {
            dir: args
                .output_dir
                .clone()
                .or_else(|| output.dir.as_deref().map(resolve)),
            pdf: output.pdf.unwrap_or(true),
            dif: output.dif.unwrap_or(false),
            res: output.res.unwrap_or(true),
            structures: output.structures.unwrap_or(true),
        };

        Ok(FitPlan {
            structures: self.structure.iter().map(|s| resolve(&s.path)).collect(),
            data: self
                .data
                .into_iter()
                .map(|mut d| {
                    d.path = resolve(&d.path);
                    d
                })
                .collect(),
            constraints: self.constraint,
            parameters: self.parameter,
            tolerance,
            output,
            progress: !args.no_progress,
        })
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let Some((key, value_str)) = kv_pair.split_once('=') else {
                return Err(CliError::Config(format!(
                    "Invalid --set format: '{}'. Expected KEY=VALUE.",
                    kv_pair
                )));
            };
            let parse_bool = || {
                value_str.parse::<bool>().map_err(|_| {
                    CliError::Config(format!("Invalid boolean value for {}: {}", key, value_str))
                })
            };

            match key.split('.').collect::<Vec<_>>().as_slice() {
                ["tolerance"] => {
                    self.tolerance = Some(value_str.parse().map_err(|_| {
                        CliError::Config(format!("Invalid float value for {}: {}", key, value_str))
                    })?);
                }
                ["output", "dir"] => {
                    self.output.get_or_insert_with(Default::default).dir =
                        Some(PathBuf::from(value_str));
                }
                ["output", "pdf"] => {
                    self.output.get_or_insert_with(Default::default).pdf = Some(parse_bool()?);
                }
                ["output", "dif"] => {
                    self.output.get_or_insert_with(Default::default).dif = Some(parse_bool()?);
                }
                ["output", "res"] => {
                    self.output.get_or_insert_with(Default::default).res = Some(parse_bool()?);
                }
                ["output", "structures"] => {
                    self.output.get_or_insert_with(Default::default).structures =
                        Some(parse_bool()?);
                }
                ["parameter", slot] => {
                    let value = match value_str.trim().parse::<f64>() {
                        Ok(v) => ParameterValue::Number(v),
                        Err(_) => ParameterValue::Reference(value_str.to_string()),
                    };
                    self.parameter_mut(key, slot)?.value = value;
                }
                ["parameter", slot, "fixed"] => {
                    let fixed = parse_bool()?;
                    self.parameter_mut(key, slot)?.fixed = fixed;
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    /// The entry for `slot`, appended with value 0 when the script has none.
    fn parameter_mut(&mut self, key: &str, slot: &str) -> Result<&mut ParameterEntry> {
        let slot: usize = slot.parse().map_err(|_| {
            CliError::Config(format!("Invalid parameter slot in {}: {}", key, slot))
        })?;
        let index = match self.parameter.iter().position(|p| p.slot == slot) {
            Some(index) => index,
            None => {
                self.parameter.push(ParameterEntry {
                    slot,
                    value: ParameterValue::Number(0.0),
                    fixed: false,
                });
                self.parameter.len() - 1
            }
        };
        Ok(&mut self.parameter[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const SCRIPT: &str = r#"
tolerance = 1e-7

[[structure]]
path = "ni.toml"

[[data]]
path = "data/ni.gr"
stype = "N"
qmax = 26.0
qsig = 0.003
fit-range = [1.5, 20.0]

[[constraint]]
variable = "lat(1)"
target = 1

[[constraint]]
variable = "pscale"
target = "@2 * 0.5"
mode = "FCOMP"

[[parameter]]
slot = 1
value = 3.52

[[parameter]]
slot = 2
value = "pscale"
fixed = true

[output]
dif = true
"#;

    fn args() -> FitArgs {
        FitArgs {
            config: PathBuf::from("fit.toml"),
            output_dir: None,
            tolerance: None,
            no_progress: false,
            set_values: vec![],
        }
    }

    fn write_script(text: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fit.toml");
        fs::write(&path, text).unwrap();
        (dir, path)
    }

    #[test]
    fn reads_script_and_resolves_paths_against_it() {
        let (dir, path) = write_script(SCRIPT);
        let plan = PartialFitConfig::from_file(&path)
            .unwrap()
            .merge_with_cli(&args())
            .unwrap();

        assert_eq!(plan.structures, vec![dir.path().join("ni.toml")]);
        assert_eq!(plan.data[0].path, dir.path().join("data/ni.gr"));
        assert_eq!(plan.data[0].stype, ScatteringType::Neutron);
        assert_eq!(plan.data[0].fit_range, Some([1.5, 20.0]));
        assert_eq!(plan.constraints[0].target, TargetEntry::Slot(1));
        assert_eq!(
            plan.constraints[1].mode().unwrap(),
            Some(ConstraintMode::FComp)
        );
        assert_eq!(plan.parameters[1].value, ParameterValue::Reference("pscale".into()));
        assert!(plan.parameters[1].fixed);
        assert_eq!(plan.tolerance, 1e-7);
        assert!(plan.output.dif && plan.output.pdf && plan.output.res);
        assert!(plan.progress);
    }

    #[test]
    fn cli_arguments_override_the_script() {
        let (_dir, path) = write_script(SCRIPT);
        let mut args = args();
        args.tolerance = Some(1e-5);
        args.output_dir = Some(PathBuf::from("/tmp/out"));
        args.no_progress = true;
        args.set_values = vec![
            "parameter.1=3.6".to_string(),
            "parameter.3=lat(2)".to_string(),
            "parameter.3.fixed=true".to_string(),
            "output.pdf=false".to_string(),
        ];
        let plan = PartialFitConfig::from_file(&path)
            .unwrap()
            .merge_with_cli(&args)
            .unwrap();

        assert_eq!(plan.tolerance, 1e-5);
        assert_eq!(plan.output.dir, Some(PathBuf::from("/tmp/out")));
        assert!(!plan.output.pdf);
        assert!(!plan.progress);
        assert_eq!(plan.parameters[0].value, ParameterValue::Number(3.6));
        assert_eq!(plan.parameters[2].slot, 3);
        assert_eq!(plan.parameters[2].value, ParameterValue::Reference("lat(2)".into()));
        assert!(plan.parameters[2].fixed);
    }

    #[test]
    fn rejects_unknown_keys() {
        let (_dir, path) = write_script(&SCRIPT.replace("qsig", "sigmaq"));
        assert!(matches!(
            PartialFitConfig::from_file(&path),
            Err(CliError::FileParsing { .. })
        ));
    }

    #[test]
    fn rejects_bad_set_values() {
        let (_dir, path) = write_script(SCRIPT);
        for bad in ["tolerance", "tolerance=abc", "output.color=red", "parameter.x=1"] {
            let mut args = args();
            args.set_values = vec![bad.to_string()];
            let result = PartialFitConfig::from_file(&path)
                .unwrap()
                .merge_with_cli(&args);
            assert!(matches!(result, Err(CliError::Config(_))), "{}", bad);
        }
    }

    #[test]
    fn requires_structures_and_data() {
        let (_dir, path) = write_script("tolerance = 1e-6\n");
        let result = PartialFitConfig::from_file(&path)
            .unwrap()
            .merge_with_cli(&args());
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn rejects_non_positive_tolerance() {
        let (_dir, path) = write_script(&SCRIPT.replace("1e-7", "-1.0"));
        let result = PartialFitConfig::from_file(&path)
            .unwrap()
            .merge_with_cli(&args());
        assert!(matches!(result, Err(CliError::Config(_))));
    }
}
