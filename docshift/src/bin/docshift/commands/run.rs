use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Table};
use docshift::{RunHalted, RunReport};

use super::{ConnectionOptions, Session, TargetArgs};
use crate::examples::ExampleGroup;
use crate::output::{GlobalOptions, OutputManager, TableDisplay, themed_table};
use crate::utils::join_ids;

pub const EXAMPLES: &[ExampleGroup] = &[
    ExampleGroup {
        title: "Apply Changesets",
        commands: &[
            "docshift run --target dev                        # Apply pending changesets",
            "docshift run --target dev --path ./changesets    # Read changesets from a directory",
        ],
    },
    ExampleGroup {
        title: "Preview",
        commands: &[
            "docshift run --target prod --dry-run             # Show what would be applied",
            "docshift --store memory run --target dev         # Exercise changesets without Redis",
        ],
    },
];

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Preview what would be applied without making changes
    #[arg(long)]
    pub dry_run: bool,

    /// Do not take the per-target run lock
    #[arg(long)]
    pub no_lock: bool,
}

impl TableDisplay for RunReport {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut table = themed_table(options, &["Target", "Applied", "Skipped", "Filtered", "Documents", "Time"]);
        let applied = if self.dry_run {
            format!("{} (would apply)", join_ids(&self.pending))
        } else {
            join_ids(&self.applied)
        };
        table.add_row(vec![
            Cell::new(&self.target),
            Cell::new(applied),
            Cell::new(self.skipped.len()),
            Cell::new(self.filtered),
            Cell::new(self.documents_affected),
            Cell::new(format!("{}ms", self.total_time_ms)),
        ]);
        table
    }

    fn to_compact(&self) -> String {
        let applied = if self.dry_run { self.pending.len() } else { self.applied.len() };
        format!(
            "target={} applied={applied} skipped={} filtered={} dry_run={}",
            self.target,
            self.skipped.len(),
            self.filtered,
            self.dry_run
        )
    }
}

pub async fn handle_run(args: RunArgs, connection: &ConnectionOptions, output: &OutputManager) -> Result<()> {
    output.heading("Run Changesets");

    if args.dry_run {
        output.warning("DRY RUN MODE - No changes will be made");
    }

    let session = Session::open(&args.target, connection, output).await?;
    let runner = session.runner(args.dry_run, args.no_lock);
    if runner.options().lock_lease.is_none() && !args.dry_run {
        output.warning("Run lock disabled");
    }

    match runner.apply(&session.target, session.changesets).await {
        Ok(report) => {
            output.heading("Summary");
            output.display(&report)?;

            if args.dry_run {
                output.warning("DRY RUN - No actual changes were made");
            } else if report.applied.is_empty() {
                output.success("Target is up to date");
            } else {
                output.success(&format!(
                    "{} changeset(s) applied in {}ms",
                    report.applied.len(),
                    report.total_time_ms
                ));
            }
            Ok(())
        }
        Err(halted) => {
            report_halt(&halted, output);
            Err(halted.into())
        }
    }
}

/// Print the last good and the failing changeset of a halted run
pub fn report_halt(halted: &RunHalted, output: &OutputManager) {
    output.error(&halted.to_string());
    let last = halted
        .last_applied
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string());
    output.key_value("Last applied", &last);
    if let Some(failed) = &halted.failed {
        output.key_value("Failed", &failed.to_string());
    }
}
