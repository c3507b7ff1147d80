//! Before/after summary of an update.

use std::fmt::Write;

use crate::control::FirmwareSnapshot;

/// Firmware state around one update run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub before: Option<FirmwareSnapshot>,
    pub after: Option<FirmwareSnapshot>,
}

impl UpdateReport {
    /// Whether anything observable changed.
    pub fn changed(&self) -> bool {
        match (&self.before, &self.after) {
            (Some(before), Some(after)) => before != after,
            _ => false,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let rows: [(&str, fn(&FirmwareSnapshot) -> &Option<String>); 3] = [
            ("firmware version", |s| &s.firmware),
            ("config version", |s| &s.config),
            ("carrier", |s| &s.carrier),
        ];
        let show = |snap: &Option<FirmwareSnapshot>, field: fn(&FirmwareSnapshot) -> &Option<String>| {
            snap.as_ref()
                .and_then(|s| field(s).clone())
                .unwrap_or_else(|| "unknown".to_string())
        };

        let _ = writeln!(out, "{:<18} {:<24} {:<24}", "", "before", "after");
        for (label, field) in rows {
            let before = show(&self.before, field);
            let after = show(&self.after, field);
            let mark = if before != after { " *" } else { "" };
            let _ = writeln!(out, "{label:<18} {before:<24} {after:<24}{mark}");
        }
        if !self.changed() {
            out.push_str("no change detected\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(fw: &str, cfg: &str, carrier: &str) -> FirmwareSnapshot {
        FirmwareSnapshot {
            firmware: Some(fw.into()),
            config: Some(cfg.into()),
            carrier: Some(carrier.into()),
        }
    }

    #[test]
    fn test_render_changes() {
        let report = UpdateReport {
            before: Some(snap("02.20.03.00", "002.020_000", "GENERIC")),
            after: Some(snap("02.24.05.06", "002.026_000", "GENERIC")),
        };
        assert!(report.changed());
        let text = report.render();
        let fw_line = text.lines().find(|l| l.starts_with("firmware version")).unwrap();
        assert!(fw_line.contains("02.20.03.00"));
        assert!(fw_line.ends_with('*'));
        let carrier_line = text.lines().find(|l| l.starts_with("carrier")).unwrap();
        assert!(!carrier_line.ends_with('*'));
        assert!(!text.contains("no change"));
    }

    #[test]
    fn test_render_missing_after() {
        let report = UpdateReport {
            before: Some(snap("02.20.03.00", "002.020_000", "GENERIC")),
            after: None,
        };
        assert!(!report.changed());
        let text = report.render();
        assert!(text.contains("unknown"));
        assert!(text.ends_with("no change detected\n"));
    }
}
