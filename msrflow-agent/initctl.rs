//! Startup control files
//!
//! A control file applies a batch of settings before the agent loop
//! starts, one per line:
//!
//! ```text
//! # comment
//! MSR::PKG_POWER_LIMIT:PL1_TIME_WINDOW package 0 0.013 # trailing comment
//! CPU_FREQUENCY_MAX_CONTROL package 1 2.1e9
//! MSR::PERF_CTL:FREQ cpu 3 0xB33F
//! ```
//!
//! Settings accept decimal, scientific, and hex integer forms. Hex values
//! are the raw field value, useful when copying numbers straight out of a
//! register dump.

use std::fmt;
use std::path::Path;

use crate::batchio::BatchIo;
use crate::config::Domain;
use crate::error::{MsrflowError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct InitControl {
    pub name: String,
    pub domain: Domain,
    pub domain_idx: usize,
    pub setting: f64,
}

impl fmt::Display for InitControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.name, self.domain, self.domain_idx, self.setting
        )
    }
}

fn parse_setting(token: &str) -> Option<f64> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|raw| raw as f64);
    }
    token.parse::<f64>().ok()
}

/// Parse a control file. Blank lines and `#` comments are skipped;
/// anything after `#` on a setting line is a comment too.
pub fn parse(content: &str) -> Result<Vec<InitControl>> {
    let mut controls = Vec::new();
    for (line_no, raw_line) in content.lines().enumerate() {
        let line = raw_line
            .split_once('#')
            .map_or(raw_line, |(before, _)| before)
            .trim();
        if line.is_empty() {
            continue;
        }
        let bad_line = |what: &str| {
            MsrflowError::Parse(format!(
                "line {}: {what}: {raw_line:?}",
                line_no + 1
            ))
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [name, domain, domain_idx, setting] = fields[..] else {
            return Err(bad_line("expected NAME DOMAIN INDEX SETTING"));
        };
        controls.push(InitControl {
            name: name.to_string(),
            domain: Domain::from_name(domain).map_err(|_| bad_line("unknown domain"))?,
            domain_idx: domain_idx
                .parse()
                .map_err(|_| bad_line("bad domain index"))?,
            setting: parse_setting(setting).ok_or_else(|| bad_line("bad setting"))?,
        });
    }
    Ok(controls)
}

pub fn parse_file(path: &Path) -> Result<Vec<InitControl>> {
    parse(&std::fs::read_to_string(path)?)
}

/// Render controls back into the file format, one line each.
pub fn serialize(controls: &[InitControl]) -> String {
    let mut out = String::new();
    for control in controls {
        out.push_str(&control.to_string());
        out.push('\n');
    }
    out
}

/// Write every control immediately, in file order.
pub fn apply(io: &mut BatchIo, controls: &[InitControl]) -> Result<()> {
    for control in controls {
        tracing::info!(
            "initial control: {} {} {} = {}",
            control.name,
            control.domain,
            control.domain_idx,
            control.setting
        );
        io.write_control(
            &control.name,
            control.domain,
            control.domain_idx,
            control.setting,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values_and_comments() {
        let content = "\
# power settings
CPU_POWER_LIMIT_CONTROL package 0 95.5
MSR::PKG_POWER_LIMIT:PL1_TIME_WINDOW package 1 1.3e-2 # averaging window

MSR::PERF_CTL:FREQ cpu 3 0xB33F
";
        let controls = parse(content).unwrap();
        assert_eq!(controls.len(), 3);
        assert_eq!(controls[0].name, "CPU_POWER_LIMIT_CONTROL");
        assert_eq!(controls[0].domain, Domain::Package);
        assert_eq!(controls[0].setting, 95.5);
        assert_eq!(controls[1].domain_idx, 1);
        assert_eq!(controls[1].setting, 1.3e-2);
        assert_eq!(controls[2].domain, Domain::Cpu);
        assert_eq!(controls[2].setting, 45887.0);
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        for content in [
            "CPU_POWER_LIMIT_CONTROL package 0",
            "CPU_POWER_LIMIT_CONTROL rack 0 95.0",
            "CPU_POWER_LIMIT_CONTROL package minus_one 95.0",
            "CPU_POWER_LIMIT_CONTROL package 0 ninety",
            "CPU_POWER_LIMIT_CONTROL package 0 95.0 extra",
        ] {
            let err = parse(content).unwrap_err();
            assert!(matches!(err, MsrflowError::Parse(_)), "{content}");
            assert!(err.to_string().contains("line 1"), "{err}");
        }
    }

    #[test]
    fn test_round_trip() {
        let content = "CPU_POWER_LIMIT_CONTROL package 0 95.5\nMSR::PERF_CTL:FREQ cpu 3 45887\n";
        let controls = parse(content).unwrap();
        assert_eq!(serialize(&controls), content);
        assert_eq!(parse(&serialize(&controls)).unwrap(), controls);
    }

    #[test]
    fn test_apply_writes_in_order() {
        use crate::batchio::{DriverRef, MsrBatchDriver, SimDevice};
        use crate::catalog::{self, msr_data};
        use crate::config::PlatformTopo;
        use crate::signal::TimeKeeper;
        use std::cell::RefCell;
        use std::rc::Rc;

        let topo = Rc::new(PlatformTopo::with_layout(1, 2));
        let dev = SimDevice::with_baseline(&topo);
        let driver: DriverRef = Rc::new(RefCell::new(MsrBatchDriver::new(Box::new(dev))));
        let defs = catalog::metadata::parse_document(msr_data::BASELINE_MSR_JSON).unwrap();
        let keeper = TimeKeeper::new();
        let (signals, controls) =
            catalog::build_catalogs(&defs, &topo, &driver, &keeper, true).unwrap();
        let mut io = BatchIo::new(driver, topo, signals, controls, keeper);

        let parsed = parse("CPU_POWER_LIMIT_CONTROL package 0 95.0\n").unwrap();
        apply(&mut io, &parsed).unwrap();
        assert_eq!(
            io.read_signal("MSR::PKG_POWER_LIMIT:PL1_POWER_LIMIT", Domain::Package, 0)
                .unwrap(),
            95.0
        );
    }
}
