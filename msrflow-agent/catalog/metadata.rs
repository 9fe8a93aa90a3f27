//! Register metadata documents
//!
//! Register families are described by a JSON document keyed by register
//! name; each register names its offset, domain, and bitfields. Documents
//! are validated strictly on load: unknown keys, malformed offsets, bad bit
//! ranges, and unrecognized function, domain, or aggregation names are all
//! rejected with the offending entry named, so a typo surfaces at startup
//! rather than as a silent missing signal.

use std::collections::HashMap;

use serde::Deserialize;

use msrflow_raw::field::{self, Function};

use crate::config::Domain;
use crate::error::{MsrflowError, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MsrDocument {
    msrs: HashMap<String, MsrEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MsrEntry {
    offset: String,
    domain: String,
    fields: HashMap<String, FieldEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FieldEntry {
    begin_bit: u32,
    end_bit: u32,
    function: String,
    units: String,
    scalar: f64,
    writeable: bool,
    aggregation: String,
    #[serde(default)]
    behavior: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// How per-instance samples of a field combine across a wider domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Min,
    Max,
    Average,
    ExpectSame,
}

impl Aggregation {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "average" => Ok(Self::Average),
            "expect_same" => Ok(Self::ExpectSame),
            _ => Err(MsrflowError::Parse(format!(
                "unknown aggregation name: {name:?}"
            ))),
        }
    }

    pub fn apply(&self, samples: &[f64]) -> f64 {
        match self {
            Self::Sum => crate::agg::sum(samples),
            Self::Min => crate::agg::min(samples),
            Self::Max => crate::agg::max(samples),
            Self::Average => crate::agg::average(samples),
            Self::ExpectSame => crate::agg::expect_same(samples),
        }
    }
}

const BEHAVIOR_NAMES: [&str; 4] = ["constant", "monotone", "variable", "label"];

/// Validated register description.
#[derive(Debug, Clone)]
pub struct RegisterDef {
    pub msr_name: String,
    pub offset: u64,
    pub domain: Domain,
    pub fields: Vec<FieldDef>,
}

/// Validated bitfield description.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub begin_bit: u32,
    pub end_bit: u32,
    pub function: Function,
    pub units: String,
    pub scalar: f64,
    pub writeable: bool,
    pub aggregation: Aggregation,
    pub description: Option<String>,
}

/// Parse and validate a register metadata document.
pub fn parse_document(json: &str) -> Result<Vec<RegisterDef>> {
    let doc: MsrDocument = serde_json::from_str(json)
        .map_err(|err| MsrflowError::Parse(format!("register metadata: {err}")))?;

    let mut defs = Vec::with_capacity(doc.msrs.len());
    for (msr_name, entry) in doc.msrs {
        let offset = parse_offset(&entry.offset).map_err(|err| {
            MsrflowError::Parse(format!("register {msr_name}: {err}"))
        })?;
        let domain = Domain::from_name(&entry.domain)
            .map_err(|err| MsrflowError::Parse(format!("register {msr_name}: {err}")))?;

        let mut fields = Vec::with_capacity(entry.fields.len());
        for (name, f) in entry.fields {
            let tag = format!("register {msr_name} field {name}");
            field::field_mask(f.begin_bit, f.end_bit)
                .map_err(|err| MsrflowError::Parse(format!("{tag}: {err}")))?;
            let function = Function::from_name(&f.function)
                .map_err(|err| MsrflowError::Parse(format!("{tag}: {err}")))?;
            let aggregation = Aggregation::from_name(&f.aggregation)
                .map_err(|err| MsrflowError::Parse(format!("{tag}: {err}")))?;
            if let Some(behavior) = &f.behavior {
                if !BEHAVIOR_NAMES.contains(&behavior.as_str()) {
                    return Err(MsrflowError::Parse(format!(
                        "{tag}: unknown behavior name: {behavior:?}"
                    )));
                }
            }
            if f.writeable && function == Function::Overflow {
                return Err(MsrflowError::Parse(format!(
                    "{tag}: overflow counters cannot be writeable"
                )));
            }
            fields.push(FieldDef {
                name,
                begin_bit: f.begin_bit,
                end_bit: f.end_bit,
                function,
                units: f.units,
                scalar: f.scalar,
                writeable: f.writeable,
                aggregation,
                description: f.description,
            });
        }
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        defs.push(RegisterDef {
            msr_name,
            offset,
            domain,
            fields,
        });
    }
    defs.sort_by(|a, b| a.msr_name.cmp(&b.msr_name));
    Ok(defs)
}

fn parse_offset(text: &str) -> Result<u64> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .ok_or_else(|| {
            MsrflowError::Parse(format!("offset {text:?} is not a hex literal"))
        })?;
    u64::from_str_radix(digits, 16)
        .map_err(|_| MsrflowError::Parse(format!("offset {text:?} is not a hex literal")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(function: &str, aggregation: &str) -> String {
        format!(
            r#"{{"msrs": {{"PKG_ENERGY_STATUS": {{
                "offset": "0x611",
                "domain": "package",
                "fields": {{"ENERGY": {{
                    "begin_bit": 0, "end_bit": 31,
                    "function": "{function}", "units": "joules",
                    "scalar": 6.103515625e-05, "writeable": false,
                    "aggregation": "{aggregation}",
                    "behavior": "monotone",
                    "description": "Accumulated package energy."
                }}}}
            }}}}}}"#
        )
    }

    #[test]
    fn test_parse_valid_document() {
        let defs = parse_document(&entry("overflow", "sum")).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].offset, 0x611);
        assert_eq!(defs[0].domain, Domain::Package);
        let f = &defs[0].fields[0];
        assert_eq!(f.name, "ENERGY");
        assert_eq!(f.function, Function::Overflow);
        assert_eq!(f.aggregation, Aggregation::Sum);
        assert!(!f.writeable);
    }

    #[test]
    fn test_unknown_function_rejected() {
        let err = parse_document(&entry("linear", "sum")).unwrap_err();
        assert!(err.to_string().contains("ENERGY"), "{err}");
    }

    #[test]
    fn test_unknown_aggregation_rejected() {
        assert!(parse_document(&entry("overflow", "median")).is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let json = r#"{"msrs": {}, "version": 3}"#;
        assert!(matches!(
            parse_document(json),
            Err(MsrflowError::Parse(_))
        ));
    }

    #[test]
    fn test_decimal_offset_rejected() {
        let json = r#"{"msrs": {"X": {"offset": "1553", "domain": "package", "fields": {}}}}"#;
        assert!(parse_document(json).is_err());
    }

    #[test]
    fn test_bad_bit_range_rejected() {
        let json = r#"{"msrs": {"X": {"offset": "0x10", "domain": "cpu", "fields": {
            "F": {"begin_bit": 12, "end_bit": 4, "function": "scale", "units": "none",
                  "scalar": 1.0, "writeable": false, "aggregation": "sum"}}}}}"#;
        assert!(parse_document(json).is_err());
    }

    #[test]
    fn test_writeable_overflow_rejected() {
        let json = r#"{"msrs": {"X": {"offset": "0x10", "domain": "cpu", "fields": {
            "F": {"begin_bit": 0, "end_bit": 31, "function": "overflow", "units": "none",
                  "scalar": 1.0, "writeable": true, "aggregation": "sum"}}}}}"#;
        assert!(parse_document(json).is_err());
    }

    #[test]
    fn test_aggregation_apply() {
        assert_eq!(Aggregation::Sum.apply(&[1.0, 2.0]), 3.0);
        assert_eq!(Aggregation::Min.apply(&[1.0, 2.0]), 1.0);
        assert!(Aggregation::ExpectSame.apply(&[1.0, 2.0]).is_nan());
    }
}
