//! Secret descriptor resolution at configuration load.
//!
//! Any string field of the configuration document may be replaced by a
//! `{"$secret": "LOGICAL_NAME"}` descriptor. Descriptors are resolved by an
//! ordered provider chain before the document is deserialized into its typed
//! form. Missing secrets abort the load: they never degrade to empty strings.

use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

pub const SECRET_DESCRIPTOR_KEY: &str = "$secret";

const DEFAULT_FILE_PROVIDER_ROOT: &str = "/run/secrets";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret `{name}` was not found by any provider")]
    NotFound { name: String },

    /// A provider failed in a way that must not silently fall through
    /// (permission denied, undecodable content, …).
    #[error("provider `{provider}` failed while resolving secret `{name}`")]
    Fatal {
        provider: &'static str,
        name: String,
        source: anyhow::Error,
    },

    #[error("secret name `{name}` contains a path separator or parent reference")]
    BadName { name: String },

    #[error("malformed `$secret` descriptor at `{path}`")]
    BadDescriptor { path: String },
}

pub enum Resolution {
    Found(String),
    NotFound,
}

pub trait SecretProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(NotFound)` lets the chain continue; `Err` aborts resolution.
    fn resolve(&self, name: &str) -> Result<Resolution, anyhow::Error>;
}

/// Reads secrets from files mounted under a root directory
/// (`/run/secrets` by default, the usual container secret mount).
pub struct FileProvider {
    root: Utf8PathBuf,
}

impl FileProvider {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn validate_name(name: &str) -> bool {
        !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
    }
}

impl Default for FileProvider {
    fn default() -> Self {
        Self::new(Utf8Path::new(DEFAULT_FILE_PROVIDER_ROOT))
    }
}

impl SecretProvider for FileProvider {
    fn name(&self) -> &'static str {
        "file"
    }

    fn resolve(&self, name: &str) -> Result<Resolution, anyhow::Error> {
        if !Self::validate_name(name) {
            anyhow::bail!("refusing to read secret with unsafe name");
        }

        match std::fs::read_to_string(self.root.join(name)) {
            Ok(contents) => Ok(Resolution::Found(contents.trim_end_matches(['\r', '\n']).to_owned())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Resolution::NotFound),
            Err(e) => Err(anyhow::Error::new(e).context("couldn't read secret file")),
        }
    }
}

/// Reads secrets from process environment variables.
pub struct EnvProvider;

impl SecretProvider for EnvProvider {
    fn name(&self) -> &'static str {
        "env"
    }

    fn resolve(&self, name: &str) -> Result<Resolution, anyhow::Error> {
        match std::env::var(name) {
            Ok(value) => Ok(Resolution::Found(value)),
            Err(std::env::VarError::NotPresent) => Ok(Resolution::NotFound),
            Err(e @ std::env::VarError::NotUnicode(_)) => {
                Err(anyhow::Error::new(e).context("environment variable is not valid unicode"))
            }
        }
    }
}

/// Ordered provider chain. First provider that doesn't answer `NotFound` wins.
///
/// No caching: values are read again on every configuration load.
pub struct SecretResolver {
    providers: Vec<Box<dyn SecretProvider>>,
}

impl SecretResolver {
    pub fn new(providers: Vec<Box<dyn SecretProvider>>) -> Self {
        Self { providers }
    }

    /// File provider over `/run/secrets`, then environment variables.
    pub fn with_default_providers() -> Self {
        Self::new(vec![Box::new(FileProvider::default()), Box::new(EnvProvider)])
    }

    pub fn resolve(&self, name: &str) -> Result<String, SecretError> {
        if !FileProvider::validate_name(name) {
            return Err(SecretError::BadName { name: name.to_owned() });
        }

        for provider in &self.providers {
            match provider.resolve(name) {
                Ok(Resolution::Found(value)) => return Ok(value),
                Ok(Resolution::NotFound) => {}
                Err(source) => {
                    return Err(SecretError::Fatal {
                        provider: provider.name(),
                        name: name.to_owned(),
                        source,
                    });
                }
            }
        }

        Err(SecretError::NotFound { name: name.to_owned() })
    }

    /// Rewrites every `{"$secret": NAME}` node of `value` in place.
    ///
    /// Tree shape is preserved and only descriptor nodes are replaced, so
    /// applying this twice is a no-op.
    pub fn resolve_value(&self, value: &mut serde_json::Value) -> Result<(), SecretError> {
        self.resolve_value_at(value, "$")
    }

    fn resolve_value_at(&self, value: &mut serde_json::Value, path: &str) -> Result<(), SecretError> {
        use serde_json::Value;

        match value {
            Value::Object(map) => {
                if map.contains_key(SECRET_DESCRIPTOR_KEY) {
                    // A descriptor object carries exactly the `$secret` key
                    // with a string name; anything else is a config mistake.
                    let name = match (map.len(), map.get(SECRET_DESCRIPTOR_KEY)) {
                        (1, Some(Value::String(name))) => name.clone(),
                        _ => return Err(SecretError::BadDescriptor { path: path.to_owned() }),
                    };

                    *value = Value::String(self.resolve(&name)?);
                } else {
                    for (key, child) in map.iter_mut() {
                        self.resolve_value_at(child, &format!("{path}.{key}"))?;
                    }
                }
            }
            Value::Array(items) => {
                for (idx, child) in items.iter_mut().enumerate() {
                    self.resolve_value_at(child, &format!("{path}[{idx}]"))?;
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProvider(&'static str, &'static str);

    impl SecretProvider for StaticProvider {
        fn name(&self) -> &'static str {
            "static"
        }

        fn resolve(&self, name: &str) -> Result<Resolution, anyhow::Error> {
            if name == self.0 {
                Ok(Resolution::Found(self.1.to_owned()))
            } else {
                Ok(Resolution::NotFound)
            }
        }
    }

    struct FatalProvider;

    impl SecretProvider for FatalProvider {
        fn name(&self) -> &'static str {
            "fatal"
        }

        fn resolve(&self, _name: &str) -> Result<Resolution, anyhow::Error> {
            anyhow::bail!("permission denied")
        }
    }

    #[test]
    fn first_provider_with_a_value_wins() {
        let resolver = SecretResolver::new(vec![
            Box::new(StaticProvider("A", "from-first")),
            Box::new(StaticProvider("A", "from-second")),
            Box::new(StaticProvider("B", "b-value")),
        ]);

        assert_eq!(resolver.resolve("A").expect("resolved"), "from-first");
        assert_eq!(resolver.resolve("B").expect("resolved"), "b-value");
    }

    #[test]
    fn missing_secret_fails_naming_it() {
        let resolver = SecretResolver::new(vec![Box::new(StaticProvider("A", "x"))]);
        let error = resolver.resolve("ABSENT").expect_err("must fail");
        assert!(error.to_string().contains("ABSENT"));
    }

    #[test]
    fn fatal_provider_aborts_the_chain() {
        let resolver = SecretResolver::new(vec![
            Box::new(FatalProvider),
            Box::new(StaticProvider("A", "never-reached")),
        ]);

        assert!(matches!(resolver.resolve("A"), Err(SecretError::Fatal { .. })));
    }

    #[test]
    fn file_provider_rejects_traversal_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).expect("utf-8 tempdir");
        std::fs::write(root.join("MY_SECRET"), "hunter2\n").expect("write");

        let provider = FileProvider::new(root);

        match provider.resolve("MY_SECRET").expect("readable") {
            Resolution::Found(value) => assert_eq!(value, "hunter2"),
            Resolution::NotFound => panic!("secret file exists"),
        }

        assert!(provider.resolve("../MY_SECRET").is_err());
        assert!(provider.resolve("a/b").is_err());
        assert!(provider.resolve("a\\b").is_err());
    }

    #[test]
    fn env_provider_resolves_from_environment() {
        // SAFETY: tests in this module do not race on this variable.
        unsafe { std::env::set_var("OBO_GW_TEST_SECRET", "s3cr3t") };

        match EnvProvider.resolve("OBO_GW_TEST_SECRET").expect("no fatal error") {
            Resolution::Found(value) => assert_eq!(value, "s3cr3t"),
            Resolution::NotFound => panic!("variable was just set"),
        }

        assert!(matches!(
            EnvProvider.resolve("OBO_GW_TEST_SECRET_ABSENT"),
            Ok(Resolution::NotFound)
        ));
    }

    #[test]
    fn resolve_value_rewrites_only_descriptors() {
        let resolver = SecretResolver::new(vec![Box::new(StaticProvider("DB_PASSWORD", "hunter2"))]);

        let mut config = serde_json::json!({
            "literal": "kept",
            "nested": { "clientSecret": { "$secret": "DB_PASSWORD" } },
            "list": [1, { "$secret": "DB_PASSWORD" }, "tail"],
        });

        resolver.resolve_value(&mut config).expect("resolved");

        let expected = serde_json::json!({
            "literal": "kept",
            "nested": { "clientSecret": "hunter2" },
            "list": [1, "hunter2", "tail"],
        });
        assert_eq!(config, expected);

        // Second application is a no-op.
        let snapshot = config.clone();
        resolver.resolve_value(&mut config).expect("resolved again");
        assert_eq!(config, snapshot);
    }

    #[test]
    fn malformed_descriptor_is_rejected() {
        let resolver = SecretResolver::new(vec![Box::new(StaticProvider("A", "x"))]);

        let mut extra_keys = serde_json::json!({ "$secret": "A", "other": 1 });
        assert!(matches!(
            resolver.resolve_value(&mut extra_keys),
            Err(SecretError::BadDescriptor { .. })
        ));

        let mut non_string = serde_json::json!({ "$secret": 42 });
        assert!(matches!(
            resolver.resolve_value(&mut non_string),
            Err(SecretError::BadDescriptor { .. })
        ));
    }
}
