use anyhow::{Context, Result};
use clap::Args;
use docshift::ChangesetId;

use super::{ConnectionOptions, Session, TargetArgs};
use crate::examples::ExampleGroup;
use crate::output::OutputManager;

pub const EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Recovery",
    commands: &[
        "docshift resolve 4.1 --target dev --applied       # Record a changeset without running it",
        "docshift resolve 4.1 --target dev --rolled-back   # Flag a changeset as rolled back",
    ],
}];

#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    /// Changeset id to resolve
    pub id: ChangesetId,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Mark the changeset as applied
    #[arg(long, conflicts_with = "rolled_back", required_unless_present = "rolled_back")]
    pub applied: bool,

    /// Mark the changeset as rolled back
    #[arg(long, conflicts_with = "applied")]
    pub rolled_back: bool,

    /// Do not take the per-target run lock
    #[arg(long)]
    pub no_lock: bool,
}

pub async fn handle_resolve(args: ResolveArgs, connection: &ConnectionOptions, output: &OutputManager) -> Result<()> {
    let status = if args.applied { "applied" } else { "rolled back" };

    output.heading(&format!("Resolve Changeset: {}", args.id));
    output.info(&format!("Marking changeset as: {status}"));

    let session = Session::open(&args.target, connection, output).await?;
    let runner = session.runner(false, args.no_lock);

    if args.applied {
        let changeset = session
            .changesets
            .iter()
            .find(|changeset| changeset.id == args.id && session.target.accepts(&changeset.context))
            .with_context(|| format!("No changeset {} for target '{}' in the changeset directory", args.id, session.target.name))?;

        if runner.mark_applied(&session.target, changeset).await? {
            output.success(&format!("Marked '{}' as applied", args.id));
        } else {
            output.warning(&format!("Changeset '{}' is already marked as applied", args.id));
        }
    } else if runner.mark_rolled_back(&session.target, &args.id).await? {
        output.success(&format!("Marked '{}' as rolled back", args.id));
    } else {
        output.warning(&format!("Changeset '{}' is not marked as applied", args.id));
    }

    Ok(())
}
