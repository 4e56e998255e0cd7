//! JSON and TOML load descriptions.
//!
//! A description is one node with optional nested `loads`:
//!
//! ```toml
//! duration = "30s"
//! repeat = 2
//! cpu = 40
//! memory = "512MiB"
//! disk_output = "10MB/s"
//!
//! [[loads]]
//! duration = "500ms"
//! cpu = 90
//! ```
//!
//! Bare numbers mean seconds, bytes or bytes per second. Descriptions are
//! turned into builders, so nesting goes through the same composition checks
//! as code-built trees.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::core::errors::{Result, SlgError};
use crate::core::units::{ByteUnit, TimeUnit};
use crate::load::builder::LoadSpecBuilder;
use crate::load::spec::LoadSpec;

const QUANTITY_PATTERN: &str = r"^\s*(-?\d+)\s*([A-Za-z]*)\s*(/\s*s(?:ec)?)?\s*$";

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Quantity {
    Number(i64),
    Text(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct LoadDescription {
    duration: Option<Quantity>,
    repeat: Option<i64>,
    cpu: Option<i64>,
    memory: Option<Quantity>,
    disk_input: Option<Quantity>,
    disk_output: Option<Quantity>,
    loads: Vec<LoadDescription>,
}

fn quantity_regex() -> Result<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(QUANTITY_PATTERN).ok())
        .as_ref()
        .ok_or_else(|| SlgError::Runtime {
            details: "quantity pattern failed to compile".to_string(),
        })
}

/// Split `"512MiB"` / `"10 MB/s"` / `"30s"` into amount, suffix and rate marker.
fn split_quantity(field: &'static str, raw: &str) -> Result<(u64, String, bool)> {
    let caps = quantity_regex()?
        .captures(raw)
        .ok_or_else(|| SlgError::DescriptionParse {
            context: field,
            details: format!("malformed quantity {raw:?}"),
        })?;
    let digits = &caps[1];
    let amount = parse_non_negative(field, digits)?;
    let suffix = caps.get(2).map_or("", |m| m.as_str()).to_string();
    Ok((amount, suffix, caps.get(3).is_some()))
}

fn parse_non_negative(field: &'static str, digits: &str) -> Result<u64> {
    if digits.starts_with('-') {
        return Err(SlgError::validation(field, format!("{digits} is negative")));
    }
    digits.parse::<u64>().map_err(|err| SlgError::DescriptionParse {
        context: field,
        details: format!("{digits}: {err}"),
    })
}

fn non_negative(field: &'static str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| SlgError::validation(field, format!("{value} is negative")))
}

fn duration_of(quantity: &Quantity) -> Result<(u64, TimeUnit)> {
    match quantity {
        Quantity::Number(secs) => Ok((non_negative("duration", *secs)?, TimeUnit::Seconds)),
        Quantity::Text(raw) => {
            let (amount, suffix, per_second) = split_quantity("duration", raw)?;
            let unit = TimeUnit::from_suffix(&suffix)
                .filter(|_| !per_second)
                .ok_or_else(|| SlgError::DescriptionParse {
                    context: "duration",
                    details: format!("unknown time unit in {raw:?}"),
                })?;
            Ok((amount, unit))
        }
    }
}

fn bytes_of(field: &'static str, quantity: &Quantity) -> Result<u64> {
    match quantity {
        Quantity::Number(bytes) => non_negative(field, *bytes),
        Quantity::Text(raw) => {
            let (amount, suffix, _) = split_quantity(field, raw)?;
            let unit = ByteUnit::from_suffix(&suffix).ok_or_else(|| SlgError::DescriptionParse {
                context: field,
                details: format!("unknown byte unit in {raw:?}"),
            })?;
            unit.to_bytes(field, amount)
        }
    }
}

impl LoadDescription {
    fn to_builder(&self) -> Result<LoadSpecBuilder> {
        let builder = LoadSpecBuilder::new();
        if let Some(duration) = &self.duration {
            let (amount, unit) = duration_of(duration)?;
            builder.lasting(amount, unit)?;
        }
        if let Some(repeat) = self.repeat {
            let repeat = u32::try_from(non_negative("repeat", repeat)?)
                .map_err(|_| SlgError::validation("repeat", format!("{repeat} is too large")))?;
            builder.repeat(repeat);
        }
        if let Some(cpu) = self.cpu {
            let cpu = u32::try_from(non_negative("cpu", cpu)?)
                .map_err(|_| SlgError::validation("cpu", format!("{cpu} is out of range")))?;
            builder.cpu(cpu)?;
        }
        if let Some(memory) = &self.memory {
            builder.memory(bytes_of("memory", memory)?, ByteUnit::Bytes)?;
        }
        if let Some(rate) = &self.disk_input {
            builder.disk_input(bytes_of("disk_input", rate)?, ByteUnit::Bytes)?;
        }
        if let Some(rate) = &self.disk_output {
            builder.disk_output(bytes_of("disk_output", rate)?, ByteUnit::Bytes)?;
        }
        for child in &self.loads {
            builder.add_load(&child.to_builder()?)?;
        }
        Ok(builder)
    }
}

/// Parse a JSON description.
pub fn from_json_str(raw: &str, max_depth: usize) -> Result<LoadSpec> {
    let description: LoadDescription =
        serde_json::from_str(raw).map_err(|err| SlgError::DescriptionParse {
            context: "json",
            details: err.to_string(),
        })?;
    description.to_builder()?.build_with_max_depth(max_depth)
}

/// Parse a TOML description.
pub fn from_toml_str(raw: &str, max_depth: usize) -> Result<LoadSpec> {
    let description: LoadDescription =
        toml::from_str(raw).map_err(|err| SlgError::DescriptionParse {
            context: "toml",
            details: err.to_string(),
        })?;
    description.to_builder()?.build_with_max_depth(max_depth)
}

/// Pick the parser by extension; anything other than `.json` is read as TOML.
pub fn from_path(path: &std::path::Path, max_depth: usize) -> Result<LoadSpec> {
    let raw = std::fs::read_to_string(path).map_err(|err| SlgError::io(path, err))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        from_json_str(&raw, max_depth)
    } else {
        from_toml_str(&raw, max_depth)
    }
}

/// Parse a standalone duration such as `"250ms"` or `"2m"`.
pub fn parse_duration(raw: &str) -> Result<(u64, TimeUnit)> {
    duration_of(&Quantity::Text(raw.to_string()))
}

/// Parse a standalone byte size or rate such as `"512MiB"` or `"10MB/s"`.
pub fn parse_bytes(field: &'static str, raw: &str) -> Result<u64> {
    bytes_of(field, &Quantity::Text(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::sequencer::sequence;

    #[test]
    fn quantity_pattern_compiles_and_is_cached() {
        let first = quantity_regex().unwrap();
        let second = quantity_regex().unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(split_quantity("memory", "10 MB/s").unwrap(), (10, "MB".to_string(), true));
    }

    #[test]
    fn toml_description_with_nested_loads() {
        let raw = r#"
            duration = "2s"
            repeat = 2
            cpu = 40
            memory = "512MiB"

            [[loads]]
            duration = "500ms"
            cpu = 90

            [[loads]]
            duration = 1
            disk_output = "10MB/s"
        "#;
        let spec = from_toml_str(raw, 8).unwrap();
        assert_eq!(spec.cpu(), 40);
        assert_eq!(spec.memory_bytes(), 512 << 20);
        assert_eq!(spec.repetitions(), 2);
        assert_eq!(spec.children().len(), 2);
        assert_eq!(spec.children()[0].time_unit(), TimeUnit::Milliseconds);
        assert_eq!(spec.children()[1].disk_output_bps(), 10 << 20);
        assert_eq!(sequence(&spec).count(), 6);
    }

    #[test]
    fn json_description_parses() {
        let raw = r#"{"duration": "1m", "cpu": 10, "loads": [{"cpu": 5}]}"#;
        let spec = from_json_str(raw, 8).unwrap();
        assert_eq!(spec.time_unit(), TimeUnit::Minutes);
        assert_eq!(spec.children()[0].cpu(), 5);
    }

    #[test]
    fn negative_values_are_validation_errors() {
        assert!(matches!(
            from_json_str(r#"{"cpu": -1}"#, 8),
            Err(SlgError::Validation { field: "cpu", .. })
        ));
        assert!(matches!(
            from_json_str(r#"{"duration": "-5s"}"#, 8),
            Err(SlgError::Validation { .. })
        ));
        assert!(matches!(
            from_toml_str("repeat = -2", 8),
            Err(SlgError::Validation { field: "repeat", .. })
        ));
    }

    #[test]
    fn cpu_above_hundred_is_rejected() {
        assert!(matches!(
            from_toml_str("cpu = 101", 8),
            Err(SlgError::Validation { field: "cpu", .. })
        ));
    }

    #[test]
    fn malformed_quantities_are_parse_errors() {
        assert!(matches!(
            from_toml_str(r#"memory = "lots""#, 8),
            Err(SlgError::DescriptionParse { .. })
        ));
        assert!(matches!(
            from_toml_str(r#"duration = "5 fortnights""#, 8),
            Err(SlgError::DescriptionParse { .. })
        ));
        assert!(matches!(
            from_toml_str("unknown_key = 1", 8),
            Err(SlgError::DescriptionParse { context: "toml", .. })
        ));
    }

    #[test]
    fn standalone_quantities() {
        assert_eq!(parse_duration("250ms").unwrap(), (250, TimeUnit::Milliseconds));
        assert_eq!(parse_duration("3").unwrap(), (3, TimeUnit::Seconds));
        assert_eq!(parse_bytes("disk_input", "4 KiB/s").unwrap(), 4096);
        assert_eq!(parse_bytes("memory", "1GB").unwrap(), 1 << 30);
        assert!(parse_duration("5MB/s").is_err());
    }

    #[test]
    fn depth_guard_applies_to_descriptions() {
        let raw = r#"{"loads": [{"loads": [{"loads": [{}]}]}]}"#;
        assert!(from_json_str(raw, 4).is_ok());
        assert!(matches!(
            from_json_str(raw, 3),
            Err(SlgError::DepthExceeded { max_depth: 3 })
        ));
    }

    #[test]
    fn from_path_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("load.json");
        std::fs::write(&json, r#"{"cpu": 12}"#).unwrap();
        assert_eq!(from_path(&json, 8).unwrap().cpu(), 12);
        let toml_path = dir.path().join("load.toml");
        std::fs::write(&toml_path, "cpu = 13").unwrap();
        assert_eq!(from_path(&toml_path, 8).unwrap().cpu(), 13);
        assert!(matches!(
            from_path(&dir.path().join("missing.toml"), 8),
            Err(SlgError::Io { .. })
        ));
    }
}
