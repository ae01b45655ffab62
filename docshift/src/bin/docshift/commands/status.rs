use anyhow::Result;
use comfy_table::{Cell, Color as TableColor, Table};
use docshift::{ChangesetState, StatusRow};
use serde::Serialize;

use super::{ConnectionOptions, Session, TargetArgs};
use crate::examples::ExampleGroup;
use crate::output::{GlobalOptions, OutputManager, TableDisplay, themed_table};
use crate::utils::{format_datetime, short_checksum};

pub const STATUS_EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Ledger Status",
    commands: &[
        "docshift status --target dev                 # Show applied, pending and drifted changesets",
        "docshift --output json status --target dev   # Machine-readable status",
    ],
}];

pub const VALIDATE_EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Drift Check",
    commands: &["docshift validate --target prod             # Exit 2 if an applied changeset was edited"],
}];

/// Status rows for one target
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub target: String,
    pub rows: Vec<StatusRow>,
}

impl StatusView {
    fn count(&self, state: ChangesetState) -> usize {
        self.rows.iter().filter(|row| row.state == state).count()
    }
}

fn state_color(state: ChangesetState) -> TableColor {
    match state {
        ChangesetState::Applied => TableColor::Green,
        ChangesetState::Pending => TableColor::Yellow,
        ChangesetState::Drifted => TableColor::Red,
        ChangesetState::RolledBack => TableColor::Magenta,
        ChangesetState::Orphaned => TableColor::DarkGrey,
    }
}

impl TableDisplay for StatusView {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut table = themed_table(options, &["Id", "Context", "State", "Applied At", "Checksum", "Description"]);
        for row in &self.rows {
            let state = Cell::new(row.state.as_str());
            let state = if options.no_color { state } else { state.fg(state_color(row.state)) };
            let checksum = row
                .checksum
                .as_deref()
                .or(row.recorded_checksum.as_deref())
                .map(short_checksum)
                .unwrap_or("-");
            table.add_row(vec![
                Cell::new(&row.id),
                Cell::new(&row.context),
                state,
                Cell::new(row.applied_at.map(format_datetime).unwrap_or_else(|| "-".to_string())),
                Cell::new(checksum),
                Cell::new(row.description.as_deref().unwrap_or("")),
            ]);
        }
        table
    }

    fn to_compact(&self) -> String {
        format!(
            "target={} applied={} pending={} drifted={} rolled_back={} orphaned={}",
            self.target,
            self.count(ChangesetState::Applied),
            self.count(ChangesetState::Pending),
            self.count(ChangesetState::Drifted),
            self.count(ChangesetState::RolledBack),
            self.count(ChangesetState::Orphaned)
        )
    }
}

pub async fn handle_status(args: TargetArgs, connection: &ConnectionOptions, output: &OutputManager) -> Result<()> {
    output.heading("Changeset Status");

    let session = Session::open(&args, connection, output).await?;
    let runner = session.runner(false, true);
    let rows = runner.status(&session.target, session.changesets).await?;
    let view = StatusView {
        target: session.target.name.clone(),
        rows,
    };

    output.display(&view)?;

    let pending = view.count(ChangesetState::Pending) + view.count(ChangesetState::RolledBack);
    if view.count(ChangesetState::Drifted) > 0 {
        output.warning("Drifted changesets block 'docshift run' until restored or resolved");
    }
    if view.count(ChangesetState::Orphaned) > 0 {
        output.warning("Orphaned ledger entries have no changeset file");
    }
    if pending > 0 {
        output.info(&format!("{pending} changeset(s) pending. Run 'docshift run' to apply"));
    } else {
        output.success("Target is up to date");
    }
    Ok(())
}

pub async fn handle_validate(args: TargetArgs, connection: &ConnectionOptions, output: &OutputManager) -> Result<()> {
    output.heading("Validate Changesets");

    let session = Session::open(&args, connection, output).await?;
    let runner = session.runner(false, true);
    match runner.validate(&session.target, session.changesets).await {
        Ok(rows) => {
            output.success(&format!("{} changeset(s) checked, no drift", rows.len()));
            Ok(())
        }
        Err(err) => {
            output.error(&err.to_string());
            Err(err.into())
        }
    }
}
