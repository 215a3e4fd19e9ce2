//! Composite nodes and their aggregated description.

use std::cell::OnceCell;
use std::time::Duration;

use super::{Location, NodeId};
use crate::format::format_duration;

/// Totals gathered from every test below a suite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuiteStats {
    pub total: usize,
    pub not_skipped: usize,
    pub with_time: usize,
    pub duration_sum: Duration,
}

impl SuiteStats {
    /// `1s 5ms`, prefixed with `>>` when fewer than half of the runnable tests
    /// have a duration and with `>` when only some lack one.
    pub fn duration_str(&self) -> Option<String> {
        if self.with_time == 0 {
            return None;
        }
        let prefix = if self.with_time * 2 < self.not_skipped {
            ">>"
        } else if self.with_time < self.not_skipped {
            ">"
        } else {
            ""
        };
        Some(format!("{}{}", prefix, format_duration(self.duration_sum)))
    }
}

#[derive(Debug, Clone)]
pub struct Suite {
    pub label: String,
    pub description_base: Option<String>,
    pub tooltip_base: Option<String>,
    pub(super) children: Vec<NodeId>,
    pub(super) running_counter: usize,
    additional_description: String,
    additional_tooltip: String,
    pub(super) location: OnceCell<Option<Location>>,
}

impl Suite {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            description_base: None,
            tooltip_base: None,
            children: Vec::new(),
            running_counter: 0,
            additional_description: String::new(),
            additional_tooltip: String::new(),
            location: OnceCell::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description_base = Some(description.into());
        self
    }

    pub fn with_tooltip(mut self, tooltip: impl Into<String>) -> Self {
        self.tooltip_base = Some(tooltip.into());
        self
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn running_counter(&self) -> usize {
        self.running_counter
    }

    pub fn description(&self) -> String {
        match &self.description_base {
            Some(base) => format!("{}{}", base, self.additional_description),
            None => self.additional_description.trim_start().to_string(),
        }
    }

    pub fn tooltip(&self) -> String {
        let mut tooltip = format!("Name: {}", self.label);
        if let Some(description) = &self.description_base {
            tooltip.push_str("\nDescription: ");
            tooltip.push_str(description);
        }
        if let Some(base) = &self.tooltip_base {
            tooltip.push_str("\n\n");
            tooltip.push_str(base);
        }
        tooltip.push_str(&self.additional_tooltip);
        tooltip
    }

    /// Refreshes the duration summary after the suite completed.
    pub fn set_summary(&mut self, stats: &SuiteStats) {
        self.additional_tooltip = format!("\n\nTests: {}", stats.total);
        match stats.duration_str() {
            Some(duration) => {
                self.additional_description = format!(" ({})", duration);
                self.additional_tooltip
                    .push_str(&format!("\n⏱Duration: {}", duration));
            }
            None => self.additional_description.clear(),
        }
    }
}
