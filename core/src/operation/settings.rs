use std::{env, fs::File, io::Read, path::Path, str::FromStr, time::Duration};

use dotenv::dotenv;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::database::data_table::BulkCopySettings;

const ENV_PREFIX: &str = "BULKMERGE_";

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error("Could not open file: {0}")]
    CouldNotOpenFile(#[from] std::io::Error),

    #[error("Could not parse settings: {0}")]
    CouldNotParseSettings(#[from] serde_yaml::Error),

    #[error("Could not substitute env variables: {0}")]
    CouldNotSubstituteEnvVariables(#[from] regex::Error),

    #[error("Environment variable {0} not found")]
    EnvironmentVariableNotFound(String),

    #[error("Environment variable {name} has an invalid value '{value}'")]
    InvalidEnvironmentValue { name: String, value: String },
}

fn default_bulk_copy_threshold() -> usize {
    100
}

fn default_command_timeout_secs() -> u64 {
    600
}

fn default_table_hint() -> String {
    "HOLDLOCK".to_string()
}

/// Tuning shared by every statement of one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    /// Collections up to this size are loaded with multi-row `INSERT`s, larger ones through
    /// bulk copy.
    #[serde(default = "default_bulk_copy_threshold")]
    pub bulk_copy_threshold: usize,

    /// Applied to every statement; `0` disables the timeout.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_table_hint")]
    pub table_hint: String,

    pub bulk_copy: BulkCopySettings,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            bulk_copy_threshold: default_bulk_copy_threshold(),
            command_timeout_secs: default_command_timeout_secs(),
            table_hint: default_table_hint(),
            bulk_copy: BulkCopySettings::default(),
        }
    }
}

fn substitute_env_variables(contents: &str) -> Result<String, SettingsError> {
    let re = Regex::new(r"\$\{([^}]+)\}")?;
    let mut missing = None;

    let result = re.replace_all(contents, |caps: &Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    match missing {
        Some(name) => Err(SettingsError::EnvironmentVariableNotFound(name)),
        None => Ok(result.into_owned()),
    }
}

fn parse_env<T: FromStr>(name: &str, value: String) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::InvalidEnvironmentValue {
        name: name.to_string(),
        value,
    })
}

impl MergeSettings {
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    pub fn bulk_copy_timeout(&self) -> Option<Duration> {
        (self.bulk_copy.timeout_secs > 0).then(|| Duration::from_secs(self.bulk_copy.timeout_secs))
    }

    /// Parses YAML settings, `${VAR}` references are replaced from the environment first.
    pub fn from_yaml(contents: &str) -> Result<Self, SettingsError> {
        let contents = substitute_env_variables(contents)?;
        let settings: MergeSettings = serde_yaml::from_str(&contents)?;
        Ok(settings)
    }

    pub fn from_file(file_path: &Path) -> Result<Self, SettingsError> {
        let mut file = File::open(file_path)?;
        let mut contents = String::new();

        file.read_to_string(&mut contents)?;

        Self::from_yaml(&contents)
    }

    /// Defaults overridden by `BULKMERGE_*` variables, `.env` is loaded first.
    pub fn from_env() -> Result<Self, SettingsError> {
        dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let mut settings = MergeSettings::default();
        let var = |suffix: &str| {
            let name = format!("{}{}", ENV_PREFIX, suffix);
            lookup(&name).map(|value| (name, value))
        };

        if let Some((name, value)) = var("BULK_COPY_THRESHOLD") {
            settings.bulk_copy_threshold = parse_env(&name, value)?;
        }
        if let Some((name, value)) = var("COMMAND_TIMEOUT_SECS") {
            settings.command_timeout_secs = parse_env(&name, value)?;
        }
        if let Some((_, value)) = var("TABLE_HINT") {
            settings.table_hint = value.trim().to_string();
        }
        if let Some((name, value)) = var("KEEP_IDENTITY") {
            settings.bulk_copy.keep_identity = parse_env(&name, value)?;
        }
        if let Some((name, value)) = var("CHECK_CONSTRAINTS") {
            settings.bulk_copy.check_constraints = parse_env(&name, value)?;
        }
        if let Some((name, value)) = var("TABLE_LOCK") {
            settings.bulk_copy.table_lock = parse_env(&name, value)?;
        }
        if let Some((name, value)) = var("BATCH_SIZE") {
            settings.bulk_copy.batch_size = parse_env(&name, value)?;
        }
        if let Some((name, value)) = var("BULK_COPY_TIMEOUT_SECS") {
            settings.bulk_copy.timeout_secs = parse_env(&name, value)?;
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io::Write};

    use super::*;

    #[test]
    fn test_defaults() {
        let settings = MergeSettings::default();
        assert_eq!(settings.bulk_copy_threshold, 100);
        assert_eq!(settings.command_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(settings.table_hint, "HOLDLOCK");
        assert_eq!(settings.bulk_copy.timeout_secs, 600);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
            bulk_copy_threshold: 10
            bulk_copy:
              keep_identity: true
              batch_size: 5000
        "#;

        let settings = MergeSettings::from_yaml(yaml).unwrap();
        assert_eq!(settings.bulk_copy_threshold, 10);
        assert_eq!(settings.command_timeout_secs, 600);
        assert!(settings.bulk_copy.keep_identity);
        assert_eq!(settings.bulk_copy.batch_size, 5000);
        assert_eq!(settings.bulk_copy.timeout_secs, 600);
    }

    #[test]
    fn test_yaml_missing_env_variable() {
        let yaml = "table_hint: ${BULKMERGE_TEST_SURELY_NOT_SET}";
        assert!(matches!(
            MergeSettings::from_yaml(yaml),
            Err(SettingsError::EnvironmentVariableNotFound(name))
                if name == "BULKMERGE_TEST_SURELY_NOT_SET"
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "command_timeout_secs: 0\ntable_hint: TABLOCKX").unwrap();

        let settings = MergeSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.command_timeout(), None);
        assert_eq!(settings.table_hint, "TABLOCKX");
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("BULKMERGE_BULK_COPY_THRESHOLD", "0"),
            ("BULKMERGE_KEEP_IDENTITY", "true"),
            ("BULKMERGE_TABLE_HINT", " UPDLOCK "),
        ]);

        let settings =
            MergeSettings::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.bulk_copy_threshold, 0);
        assert!(settings.bulk_copy.keep_identity);
        assert_eq!(settings.table_hint, "UPDLOCK");
    }

    #[test]
    fn test_from_lookup_rejects_invalid_values() {
        let result = MergeSettings::from_lookup(|name| {
            (name == "BULKMERGE_BATCH_SIZE").then(|| "lots".to_string())
        });

        assert!(matches!(
            result,
            Err(SettingsError::InvalidEnvironmentValue { name, .. })
                if name == "BULKMERGE_BATCH_SIZE"
        ));
    }
}
