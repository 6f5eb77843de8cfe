use crate::aggregate::AggregateSnapshot;
use crate::artifact::Dimension;
use crate::pipeline::RunSummary;
use itertools::Itertools;
use std::fmt::{self, Write};

/// Print the final aggregate and run counters
pub fn print_summary(summary: &RunSummary) {
    print!("{}", render_summary(summary));
}

pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_summary(&mut out, summary);
    out
}

fn write_summary(out: &mut impl Write, summary: &RunSummary) -> fmt::Result {
    let stats = &summary.stats;
    writeln!(
        out,
        "[geotally] batches: {} ({} processed, {} skipped), records decoded: {}, geocode failures: {}",
        stats.batches_emitted, stats.batches_processed, stats.batches_skipped, stats.records_decoded, stats.geocode_failures
    )?;
    for dimension in Dimension::ALL {
        write_dimension(out, &summary.aggregate, dimension)?;
    }
    Ok(())
}

fn write_dimension(out: &mut impl Write, aggregate: &AggregateSnapshot, dimension: Dimension) -> fmt::Result {
    let rows = aggregate.rows(dimension);
    let totals = aggregate.sub_key_totals(dimension);
    let key_width = totals.keys().map(|k| k.chars().count()).max().unwrap_or(0).max(dimension.header().len());

    writeln!(out)?;
    writeln!(out, "{} ({} total)", dimension.header(), aggregate.total(dimension))?;
    writeln!(out, "{}", "─".repeat(key_width + 12))?;
    if rows.is_empty() {
        return writeln!(out, "  ·");
    }

    writeln!(out, "Global")?;
    for (sub_key, count) in &totals {
        writeln!(out, "  {:<width$} │ {:>8}", sub_key, count, width = key_width)?;
    }

    let by_owner = rows.iter().group_by(|(owner, _, _)| *owner);
    for (owner, group) in &by_owner {
        writeln!(out, "{}", owner)?;
        for (_, sub_key, count) in group {
            writeln!(out, "  {:<width$} │ {:>8}", sub_key, count, width = key_width)?;
        }
    }
    Ok(())
}
