use std::io::{self, Write as _};

use duracheck_session::{ContextHandle, StackSource};

use crate::checker::Checker;

/// Render the analysis summary: per-category totals followed by numbered
/// record lists, traces symbolicated through the host stack service.
pub(crate) fn write_report(checker: &Checker, out: &mut dyn io::Write) -> io::Result<()> {
    let stores = checker.store_tracker();
    let tx = checker.tx_tracker();
    let stacks = checker.stacks();

    writeln!(out, "Number of stores not made persistent: {}", stores.dangling_count())?;
    if stores.dangling_count() != 0 {
        writeln!(out, "Stores not made persistent properly:")?;
        for (index, store) in stores.stores().enumerate() {
            numbered_trace(out, stacks, index, store.context)?;
            writeln!(
                out,
                "\tAddress: {:#x}\tsize: {}\tstate: {}",
                store.region.addr, store.region.size, store.state
            )?;
        }
        writeln!(out, "Total memory not made persistent: {}", stores.dangling_bytes())?;
    }

    if !tx.oot_stores().is_empty() {
        writeln!(out)?;
        writeln!(
            out,
            "Number of stores made without adding to transaction: {}",
            tx.oot_stores().len()
        )?;
        writeln!(out, "Stores made without adding to transactions:")?;
        for (index, store) in tx.oot_stores().iter().enumerate() {
            numbered_trace(out, stacks, index, store.context)?;
            writeln!(out, "\tAddress: {:#x}\tsize: {}", store.region.addr, store.region.size)?;
        }
    }

    if !tx.cross_events().is_empty() {
        writeln!(out)?;
        writeln!(
            out,
            "Number of overlapping regions registered in different transactions: {}",
            tx.cross_events().len()
        )?;
        writeln!(out, "Overlapping regions:")?;
        for (index, event) in tx.cross_events().iter().enumerate() {
            numbered_trace(out, stacks, index, event.duplicate.context)?;
            writeln!(
                out,
                "\tAddress: {:#x}\tsize: {}\ttx_id: {}",
                event.duplicate.region.addr, event.duplicate.region.size, event.duplicate.tx
            )?;
            writeln!(out, "   First registered here:")?;
            numbered_trace(out, stacks, index, event.original.context)?;
            writeln!(
                out,
                "\tAddress: {:#x}\tsize: {}\ttx_id: {}",
                event.original.region.addr, event.original.region.size, event.original.tx
            )?;
        }
    }

    if tx.active_count() != 0 {
        writeln!(out)?;
        writeln!(out, "Number of active transactions: {}", tx.active_count())?;
        for (index, info) in tx.active().enumerate() {
            numbered_trace(out, stacks, index, info.context())?;
            writeln!(out, "\ttx_id: {}\tnesting: {}", info.id(), info.nesting())?;
        }
    }

    if !stores.redundant_flushes().is_empty() {
        writeln!(out)?;
        writeln!(
            out,
            "Number of redundantly flushed stores: {}",
            stores.redundant_flushes().len()
        )?;
        writeln!(out, "Stores flushed multiple times:")?;
        for (index, store) in stores.redundant_flushes().iter().enumerate() {
            numbered_trace(out, stacks, index, store.context)?;
            writeln!(
                out,
                "\tAddress: {:#x}\tsize: {}\tstate: {}",
                store.region.addr, store.region.size, store.state
            )?;
        }
    }

    if !stores.superfluous_flushes().is_empty() {
        writeln!(out)?;
        writeln!(out, "Number of unnecessary flushes: {}", stores.superfluous_flushes().len())?;
        for (index, flush) in stores.superfluous_flushes().iter().enumerate() {
            numbered_trace(out, stacks, index, flush.context)?;
            writeln!(out, "\tAddress: {:#x}\tsize: {}", flush.region.addr, flush.region.size)?;
        }
    }

    if !stores.overwrites().is_empty() {
        writeln!(out)?;
        writeln!(out, "Number of overwritten stores: {}", stores.overwrites().len())?;
        writeln!(out, "Overwritten stores before they were made persistent:")?;
        for (index, store) in stores.overwrites().iter().enumerate() {
            numbered_trace(out, stacks, index, store.context)?;
            writeln!(
                out,
                "\tAddress: {:#x}\tsize: {}\tstate: {}",
                store.region.addr, store.region.size, store.state
            )?;
        }
    }

    if checker.options().error_summary {
        writeln!(out, "ERROR SUMMARY: {} errors", checker.error_count())?;
    }
    Ok(())
}

/// Enumerate the registered persistent mappings.
pub(crate) fn write_mappings(checker: &Checker, out: &mut dyn io::Write) -> io::Result<()> {
    writeln!(out, "Registered persistent memory regions:")?;
    for (index, mapping) in checker.mappings().enumerate() {
        writeln!(out, "[{index}] Mapping base: {:#x}\tsize: {}", mapping.addr, mapping.size)?;
    }
    Ok(())
}

/// Write `[index]` followed by the symbolicated trace, if there is one.
fn numbered_trace(
    out: &mut dyn io::Write,
    stacks: &dyn StackSource,
    index: usize,
    context: ContextHandle,
) -> io::Result<()> {
    write!(out, "[{index}]")?;
    let trace = stacks.describe(context);
    if trace.is_empty() {
        writeln!(out)
    } else {
        write!(out, "\n{trace}")
    }
}
