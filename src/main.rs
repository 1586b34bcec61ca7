use applique::apply::{Applier, ApplyOptions, Workspace};
use applique::oid::HashAlgo;
use applique::util;
use applique::ws::{WsErrorAction, WsIgnoreAction};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "applique", about = "Apply unified diffs to a working tree and index")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a patch to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long, default_value = ".")]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Remove this many leading path components from patch paths
        #[arg(short)]
        p: Option<usize>,
        /// Apply the patch in reverse
        #[arg(long, short = 'R')]
        reverse: bool,
        /// Leave rejected hunks in .rej files
        #[arg(long)]
        reject: bool,
        /// Fall back to three-way merge when hunks do not apply
        #[arg(long = "3way", short = '3')]
        threeway: bool,
        /// Make sure the patch applies to the current index, and update it
        #[arg(long)]
        index: bool,
        /// Apply to the index only, without touching the working tree
        #[arg(long)]
        cached: bool,
        /// Check applicability without applying
        #[arg(long)]
        check: bool,
        /// Don't expect at least one line of context
        #[arg(long)]
        unidiff_zero: bool,
        /// Ensure at least this many lines of surrounding context match
        #[arg(short = 'C')]
        context: Option<usize>,
        /// Whitespace error action: nowarn, warn, error or fix
        #[arg(long)]
        whitespace: Option<String>,
        /// Ignore whitespace changes when finding context
        #[arg(long)]
        ignore_space_change: bool,
        /// Do not trust the line counts in hunk headers
        #[arg(long)]
        recount: bool,
        /// Don't return an error for empty patches
        #[arg(long)]
        allow_empty: bool,
        /// Apply only changes matching these patterns
        #[arg(long)]
        include: Vec<String>,
        /// Skip changes matching these patterns
        #[arg(long)]
        exclude: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply {
            target,
            patch,
            p,
            reverse,
            reject,
            threeway,
            index,
            cached,
            check,
            unidiff_zero,
            context,
            whitespace,
            ignore_space_change,
            recount,
            allow_empty,
            include,
            exclude,
        } => {
            let ws_error_action = match whitespace.as_deref() {
                Some(s) => WsErrorAction::parse(s)
                    .ok_or_else(|| anyhow::anyhow!("unrecognized whitespace option '{s}'"))?,
                None => WsErrorAction::Warn,
            };
            let mut opts = ApplyOptions {
                p_value: p,
                reverse,
                with_reject: reject,
                threeway,
                check_index: index,
                cached,
                check,
                unidiff_zero,
                ws_error_action,
                recount,
                allow_empty,
                ..ApplyOptions::default()
            };
            if let Some(n) = context {
                opts.context_limit = n;
            }
            if ignore_space_change {
                opts.ws_ignore_action = WsIgnoreAction::Change;
            }
            for pattern in &include {
                opts.include.push(glob::Pattern::new(pattern)?);
            }
            for pattern in &exclude {
                opts.exclude.push(glob::Pattern::new(pattern)?);
            }

            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());

            let start = Instant::now();
            let raw = util::mmap_file(&patch)?;
            let ws = Workspace::open(&target, HashAlgo::Sha1);
            let mut applier = Applier::new(&ws, opts)?;
            let summary = applier.apply_patch(&raw)?;
            let elapsed = start.elapsed();

            println!("\nPatch applied.");
            println!("  Files created: {}", summary.files_created);
            println!("  Files modified: {}", summary.files_modified);
            println!("  Files renamed: {}", summary.files_renamed);
            println!("  Files deleted: {}", summary.files_deleted);
            println!("  Hunks applied: {}", summary.hunks_applied);
            println!("  Hunks rejected: {}", summary.hunks_rejected);
            if summary.conflicted_files > 0 {
                println!("  Files with conflicts: {}", summary.conflicted_files);
            }
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());

            if !summary.is_clean() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
