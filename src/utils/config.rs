//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(KikuError)` on parser failure.
///
/// Example:
/// ```no_compile
/// let config = parsed_config!(config_str => MyConfig; backoff_ms, persist)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::KikuError> {
            let mut config: $config_type = Default::default();
            let config_str = match config_str {
                Some(s) => s,
                None => return Ok(config),
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::KikuError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::KikuError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        backoff_ms: u64,
        backer_dir: String,
        persist: bool,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                backoff_ms: 10,
                backer_dir: "/tmp".into(),
                persist: false,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), KikuError> {
        let config =
            parsed_config!(None => TestConfig; backoff_ms, backer_dir, persist)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), KikuError> {
        let config_str = Some("backer_dir = '/var/kiku'\npersist = true");
        let config =
            parsed_config!(config_str => TestConfig; backer_dir, persist)?;
        let ref_config = TestConfig {
            backoff_ms: 10,
            backer_dir: "/var/kiku".into(),
            persist: true,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("xyz = 999");
        assert!(parsed_config!(config_str => TestConfig; backoff_ms).is_err());
    }

    #[test]
    fn parse_wrong_type() {
        let config_str = Some("persist = 'yes'");
        assert!(parsed_config!(config_str => TestConfig; persist).is_err());
    }
}
