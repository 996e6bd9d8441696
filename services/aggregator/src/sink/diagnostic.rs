//! Diagnostic log sink
//!
//! Renders each batch as a human-readable report and emits it through
//! `tracing`. Rendering is a pure function so the exact text is testable;
//! optional percentage lines are left out when the average is null.

use async_trait::async_trait;
use tracing::{info, warn};
use types::aggregate::AggregateRow;
use types::batch::UpdateBatch;

use super::{Sink, SinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLevel {
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    pub level: LineLevel,
    pub text: String,
}

impl ReportLine {
    fn info(text: impl Into<String>) -> Self {
        Self {
            level: LineLevel::Info,
            text: text.into(),
        }
    }

    fn warn(text: impl Into<String>) -> Self {
        Self {
            level: LineLevel::Warn,
            text: text.into(),
        }
    }
}

/// Render one batch report.
pub fn render(batch: &UpdateBatch) -> Vec<ReportLine> {
    let cycle = batch.cycle_id;
    let mut lines = vec![ReportLine::info(format!("=== BATCH {} ===", cycle))];

    if batch.is_empty() {
        lines.push(ReportLine::warn(format!("Batch {} no data to process", cycle)));
    } else {
        lines.push(ReportLine::info(format!(
            "Processed {} cryptocurrency(s) in batch {}",
            batch.len(),
            cycle
        )));
        for row in &batch.rows {
            render_row(row, &mut lines);
        }
    }

    lines.push(ReportLine::info("=".repeat(70)));
    lines
}

fn render_row(row: &AggregateRow, lines: &mut Vec<ReportLine>) {
    lines.push(ReportLine::info(format!("Cryptocurrency ID: {}", row.asset_id)));
    lines.push(ReportLine::info(format!(
        "   Average price: ${}",
        thousands(row.avg_price, 2)
    )));
    lines.push(ReportLine::info(format!(
        "   Mid-cap: ${}",
        thousands(row.avg_market_cap, 0)
    )));
    lines.push(ReportLine::info(format!(
        "   Average rating: {:.1}",
        row.avg_market_cap_rank
    )));
    lines.push(ReportLine::info(format!(
        "   Average volume: ${}",
        thousands(row.avg_total_volume, 0)
    )));
    lines.push(ReportLine::info(format!(
        "   Average 24h High: ${}",
        thousands(row.avg_high_24h, 2)
    )));
    lines.push(ReportLine::info(format!(
        "   Average Low 24h: ${}",
        thousands(row.avg_low_24h, 2)
    )));
    if let Some(pct) = row.avg_price_change_pct {
        lines.push(ReportLine::info(format!("   % 24h price change: {:.2}%", pct)));
    }
    if let Some(pct) = row.avg_market_cap_change_pct {
        lines.push(ReportLine::info(format!(
            "   % 24h capitalization change: {:.2}%",
            pct
        )));
    }
    lines.push(ReportLine::info(format!("   {}", "=".repeat(60))));
}

/// Fixed-point formatting with comma thousands separators.
pub fn thousands(value: f64, decimals: usize) -> String {
    let fixed = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match fixed.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (fixed.as_str(), None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let is_zero = fixed.chars().all(|c| c == '0' || c == '.');
    let sign = if value < 0.0 && !is_zero { "-" } else { "" };
    match frac_part {
        Some(frac) => format!("{}{}.{}", sign, grouped, frac),
        None => format!("{}{}", sign, grouped),
    }
}

/// Emits batch reports through the process logger.
#[derive(Debug, Default)]
pub struct DiagnosticLogSink;

impl DiagnosticLogSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sink for DiagnosticLogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, batch: &UpdateBatch) -> Result<(), SinkError> {
        for line in render(batch) {
            match line.level {
                LineLevel::Info => info!(cycle_id = batch.cycle_id, "{}", line.text),
                LineLevel::Warn => warn!(cycle_id = batch.cycle_id, "{}", line.text),
            }
        }
        Ok(())
    }
}
