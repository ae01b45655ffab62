use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Table};
use docshift::RollbackReport;

use super::run::report_halt;
use super::{ConnectionOptions, Session, TargetArgs};
use crate::examples::ExampleGroup;
use crate::output::{GlobalOptions, OutputManager, TableDisplay, themed_table};
use crate::utils::join_ids;

pub const EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Revert Changesets",
    commands: &[
        "docshift rollback --target dev                # Revert the most recent changeset",
        "docshift rollback --target dev --count 3      # Revert the last three, newest first",
        "docshift rollback --target dev --dry-run      # Show what would be reverted",
    ],
}];

#[derive(Args, Debug, Clone)]
pub struct RollbackArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Number of applied changesets to revert
    #[arg(short, long, default_value_t = 1)]
    pub count: usize,

    /// Preview what would be reverted without making changes
    #[arg(long)]
    pub dry_run: bool,

    /// Do not take the per-target run lock
    #[arg(long)]
    pub no_lock: bool,
}

impl TableDisplay for RollbackReport {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut table = themed_table(options, &["Target", "Rolled Back", "Time"]);
        let ids = join_ids(&self.rolled_back);
        table.add_row(vec![
            Cell::new(&self.target),
            Cell::new(if self.dry_run { format!("{ids} (would roll back)") } else { ids }),
            Cell::new(format!("{}ms", self.total_time_ms)),
        ]);
        table
    }

    fn to_compact(&self) -> String {
        format!(
            "target={} rolled_back={} dry_run={}",
            self.target,
            self.rolled_back.len(),
            self.dry_run
        )
    }
}

pub async fn handle_rollback(args: RollbackArgs, connection: &ConnectionOptions, output: &OutputManager) -> Result<()> {
    output.heading("Roll Back Changesets");

    if args.count == 0 {
        output.warning("Nothing to do for --count 0");
        return Ok(());
    }
    if args.dry_run {
        output.warning("DRY RUN MODE - No changes will be made");
    }

    let session = Session::open(&args.target, connection, output).await?;
    let runner = session.runner(args.dry_run, args.no_lock);

    match runner.rollback(&session.target, session.changesets, args.count).await {
        Ok(report) => {
            output.heading("Summary");
            output.display(&report)?;
            if report.rolled_back.is_empty() {
                output.info("No applied changesets to roll back");
            } else if !args.dry_run {
                output.success(&format!("{} changeset(s) rolled back", report.rolled_back.len()));
                output.info("Rolled back changesets are pending again and will be re-applied by 'docshift run'");
            }
            Ok(())
        }
        Err(halted) => {
            report_halt(&halted, output);
            Err(halted.into())
        }
    }
}
