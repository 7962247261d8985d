//! `gbench summarize`: rebuild the summary of a run directory from its logs

use anyhow::Result;
use game_bench::{collect_from_dir, results::print_summary, ResultExporter, RunSummary};
use std::path::Path;

use super::run::dir_label;
use crate::style::{print_success, print_warning};

pub fn run(dir: &Path, export: bool) -> Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }

    let by_env = collect_from_dir(dir)?;
    if by_env.is_empty() {
        print_warning(&format!("No episode logs found under {}", dir.display()));
        return Ok(());
    }

    let summary = RunSummary::new(&dir_label(dir), &by_env, &[]);
    print_summary(&summary);

    if export {
        for path in ResultExporter::new(dir).export_all(&summary)? {
            print_success(&format!("Wrote {}", path.display()));
        }
    }
    Ok(())
}
