use anyhow::{bail, Error};
use clap::{Parser, Subcommand};

use lob_config::{Config, ConfigError};
use lob_datastore::{placeholder, ChunkStore, StoreError};
use lob_git::GitRepo;

use git_lob::checkout::{checkout, CheckoutStats};
use git_lob::progress::{ConsoleReporter, ProgressEvent};
use git_lob::prune::{prune_retention, prune_shared, prune_unreferenced};
use git_lob::sync::{fetch, push, FetchOptions, PushOptions, PushStateCache};
use git_lob::transport::{self, Transport};

const EXIT_OPERATION: i32 = 3;
const EXIT_INTEGRITY: i32 = 4;
const EXIT_REMOTE_CONFIG: i32 = 5;

#[derive(Parser)]
#[command(
    name = "git-lob",
    version,
    about = "Large binary object support for git repositories"
)]
struct Cli {
    /// Report per-file detail while working
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run as the clean filter: file content on stdin, placeholder on stdout
    FilterClean,

    /// Run as the smudge filter: placeholder on stdin, file content on stdout
    FilterSmudge,

    /// Replace placeholders in the working tree with stored content
    Checkout {
        /// Limit to these pathspecs
        paths: Vec<String>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Download LOBs required by recent history from a remote
    Fetch {
        #[arg(long, default_value = "origin")]
        remote: String,
        /// Refs to fetch for instead of the configured recent window
        refs: Vec<String>,
        /// Re-download content that is already present locally
        #[arg(long)]
        force: bool,
        /// Prune by retention after checkout completes
        #[arg(long)]
        prune: bool,
        #[arg(long)]
        dry_run: bool,
    },

    /// Upload LOBs referenced by commits not yet pushed to a remote
    Push {
        #[arg(long, default_value = "origin")]
        remote: String,
        /// Ref expressions to push; each may be a range `a..b`
        refs: Vec<String>,
        /// Re-upload everything, ignoring the pushed state cache
        #[arg(long)]
        force: bool,
        /// Re-examine all commits, probing the remote per file
        #[arg(long)]
        recheck: bool,
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete local LOBs that are out of retention and safely pushed
    Prune {
        /// Delete unreferenced LOBs instead of applying retention
        #[arg(long)]
        unreferenced: bool,
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete shared store files no repository links to anymore
    PruneShared {
        #[arg(long)]
        dry_run: bool,
    },

    /// Verify the integrity of the local store
    Fsck {
        /// Re-hash contents instead of only checking sizes
        #[arg(long)]
        deep: bool,
        /// Remove data that fails verification
        #[arg(long)]
        delete: bool,
    },

    /// Forget which commits were pushed to a remote
    PushedReset { remote: String },
}

/// Aggregate fsck failure, mapped to the integrity exit code.
#[derive(Debug, thiserror::Error)]
#[error("{failed} of {checked} LOBs failed verification")]
struct FsckFailed {
    failed: usize,
    checked: usize,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .init();

    if let Err(err) = run(&cli) {
        eprintln!("git-lob: {:#}", err);
        std::process::exit(exit_code(&err));
    }
}

fn exit_code(err: &Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_REMOTE_CONFIG;
    }
    if err.downcast_ref::<FsckFailed>().is_some() {
        return EXIT_INTEGRITY;
    }
    if let Some(store_err) = err.downcast_ref::<StoreError>() {
        if store_err.is_corruption() {
            return EXIT_INTEGRITY;
        }
    }
    EXIT_OPERATION
}

struct Env {
    repo: GitRepo,
    config: Config,
    store: ChunkStore,
}

fn open_env() -> Result<Env, Error> {
    let repo = GitRepo::discover(std::env::current_dir()?)?;
    let config = Config::load(&repo)?;
    let store = ChunkStore::open(repo.store_dir(), config.shared_store.clone())?;
    Ok(Env {
        repo,
        config,
        store,
    })
}

/// Run `work` with a progress callback wired to the console (or to
/// nothing in quiet mode).
fn with_progress<T>(
    cli: &Cli,
    work: impl FnOnce(&mut dyn FnMut(&ProgressEvent) -> bool) -> Result<T, Error>,
) -> Result<T, Error> {
    if cli.quiet {
        let mut discard = git_lob::progress::discard();
        work(&mut discard)
    } else {
        let reporter = ConsoleReporter::start(cli.verbose);
        let mut callback = reporter.callback();
        let result = work(&mut callback);
        drop(callback);
        reporter.finish();
        result
    }
}

fn run(cli: &Cli) -> Result<(), Error> {
    match &cli.command {
        Command::FilterClean => {
            let env = open_env()?;
            let mut stdin = std::io::stdin().lock();
            let mut stdout = std::io::stdout().lock();
            placeholder::clean(&env.store, &mut stdin, &mut stdout)?;
            Ok(())
        }

        Command::FilterSmudge => {
            let env = open_env()?;
            let mut stdin = std::io::stdin().lock();
            let mut stdout = std::io::stdout().lock();
            placeholder::smudge(&env.store, &mut stdin, &mut stdout)?;
            Ok(())
        }

        Command::Checkout { paths, dry_run } => {
            let env = open_env()?;
            let stats = run_checkout(cli, &env, paths, *dry_run)?;
            println!(
                "checkout: {} placeholders, {} replaced, {} missing",
                stats.placeholders, stats.replaced, stats.missing
            );
            Ok(())
        }

        Command::Fetch {
            remote,
            refs,
            force,
            prune,
            dry_run,
        } => {
            let env = open_env()?;
            let transport = transport::from_config(&env.config, remote)?;
            let options = FetchOptions {
                refs: refs.clone(),
                dry_run: *dry_run,
                force: *force,
            };

            let stats = with_progress(cli, |progress| {
                fetch(
                    &env.store,
                    &env.repo,
                    &env.config,
                    transport.as_ref(),
                    &options,
                    progress,
                )
            })?;
            println!(
                "fetch: {} required, {} downloaded, {} already present, {} not on remote",
                stats.required, stats.fetched, stats.already_present, stats.not_found
            );

            if *prune && !*dry_run {
                run_checkout(cli, &env, &[], false)?;
                let cache = PushStateCache::new(&env.repo.lob_dir());
                let transports = prune_transports(&env.config, &env.repo)?;
                let stats = with_progress(cli, |progress| {
                    prune_retention(
                        &env.store,
                        &env.repo,
                        &env.config,
                        &cache,
                        &transports,
                        false,
                        progress,
                    )
                })?;
                println!("prune: {} deleted", stats.deleted);
            }
            Ok(())
        }

        Command::Push {
            remote,
            refs,
            force,
            recheck,
            dry_run,
        } => {
            let env = open_env()?;
            let transport = transport::from_config(&env.config, remote)?;
            let cache = PushStateCache::new(&env.repo.lob_dir());
            let options = PushOptions {
                refs: refs.clone(),
                dry_run: *dry_run,
                force: *force,
                recheck_remote: *recheck,
            };

            let stats = with_progress(cli, |progress| {
                push(
                    &env.store,
                    &env.repo,
                    &env.config,
                    transport.as_ref(),
                    &cache,
                    &options,
                    progress,
                )
            })?;
            println!(
                "push: {} uploaded, {} skipped, {} missing everywhere, {} commits recorded",
                stats.uploaded, stats.skipped, stats.not_found, stats.commits_marked
            );
            if stats.not_found > 0 {
                bail!("{} LOBs exist neither locally nor on the remote", stats.not_found);
            }
            Ok(())
        }

        Command::Prune {
            unreferenced,
            dry_run,
        } => {
            let env = open_env()?;
            let stats = if *unreferenced {
                with_progress(cli, |progress| {
                    prune_unreferenced(&env.store, &env.repo, &env.config, *dry_run, progress)
                })?
            } else {
                let cache = PushStateCache::new(&env.repo.lob_dir());
                let transports = prune_transports(&env.config, &env.repo)?;
                with_progress(cli, |progress| {
                    prune_retention(
                        &env.store,
                        &env.repo,
                        &env.config,
                        &cache,
                        &transports,
                        *dry_run,
                        progress,
                    )
                })?
            };
            println!(
                "prune{}: {} deleted, {} retained (referenced), {} retained (recent), {} retained (not pushed)",
                if *dry_run { " (dry run)" } else { "" },
                stats.deleted,
                stats.retained_referenced,
                stats.retained_recent,
                stats.retained_not_pushed,
            );
            Ok(())
        }

        Command::PruneShared { dry_run } => {
            let env = open_env()?;
            let stats = with_progress(cli, |progress| {
                prune_shared(&env.store, *dry_run, progress)
            })?;
            println!(
                "prune-shared{}: {} files examined, {} deleted",
                if *dry_run { " (dry run)" } else { "" },
                stats.examined,
                stats.deleted
            );
            Ok(())
        }

        Command::Fsck { deep, delete } => {
            let env = open_env()?;
            run_fsck(&env, *deep, *delete)
        }

        Command::PushedReset { remote } => {
            let env = open_env()?;
            let cache = PushStateCache::new(&env.repo.lob_dir());
            cache.reset(remote)?;
            println!("pushed state for remote '{}' cleared", remote);
            Ok(())
        }
    }
}

fn run_checkout(
    cli: &Cli,
    env: &Env,
    paths: &[String],
    dry_run: bool,
) -> Result<CheckoutStats, Error> {
    let stats = with_progress(cli, |progress| {
        checkout(&env.store, &env.repo, paths, dry_run, progress)
    })?;

    // a fetch can fill in what the store is missing; run one and take a
    // second pass when configured to
    if stats.missing > 0 && env.config.autofetch && !dry_run {
        let remote = default_remote(&env.config);
        let transport = transport::from_config(&env.config, &remote)?;
        let options = FetchOptions::default();
        with_progress(cli, |progress| {
            fetch(
                &env.store,
                &env.repo,
                &env.config,
                transport.as_ref(),
                &options,
                progress,
            )
        })?;
        let stats = with_progress(cli, |progress| {
            checkout(&env.store, &env.repo, paths, dry_run, progress)
        })?;
        // the remote was consulted and the content still is not there;
        // that is the same condition push treats as fatal
        if stats.missing > 0 {
            bail!(
                "{} LOBs are still missing after fetching from '{}'",
                stats.missing,
                remote
            );
        }
        return Ok(stats);
    }

    Ok(stats)
}

fn default_remote(config: &Config) -> String {
    if config.prune_remote == "*" {
        "origin".to_string()
    } else {
        config.prune_remote.clone()
    }
}

/// Transports for the remotes prune may verify against. Remotes without
/// a usable provider configuration are skipped; retention prune then
/// simply retains anything only they could have vouched for.
fn prune_transports(config: &Config, repo: &GitRepo) -> Result<Vec<Box<dyn Transport>>, Error> {
    let remotes: Vec<String> = if config.prune_remote == "*" {
        repo.list_remotes()?
    } else {
        vec![config.prune_remote.clone()]
    };

    let mut transports = Vec::new();
    for remote in remotes {
        match transport::from_config(config, &remote) {
            Ok(transport) => transports.push(transport),
            Err(err) => log::debug!("remote '{}' has no usable transport - {:#}", remote, err),
        }
    }
    Ok(transports)
}

fn run_fsck(env: &Env, deep: bool, delete: bool) -> Result<(), Error> {
    let shas = env.store.list_lobs()?;
    let mut failed = 0;

    for sha in &shas {
        match env.store.check(sha, deep) {
            Ok(()) => (),
            Err(err) => {
                failed += 1;
                eprintln!("fsck: {}", err);
                if delete {
                    match err {
                        StoreError::WrongSize { ref path, .. } => {
                            // the damage is one chunk; drop just that
                            // file so a fetch can restore it
                            std::fs::remove_file(path)?;
                            eprintln!("fsck: removed {}", path.display());
                        }
                        StoreError::Integrity { .. } => {
                            env.store.delete(sha)?;
                            eprintln!("fsck: removed LOB {}", sha);
                        }
                        // incomplete but not provably corrupt: a fetch
                        // can complete it, nothing to remove
                        StoreError::NotFound { .. } | StoreError::Io { .. } => (),
                    }
                }
            }
        }
    }

    println!(
        "fsck: {} LOBs checked{}, {} failed",
        shas.len(),
        if deep { " (deep)" } else { "" },
        failed
    );

    if failed > 0 {
        return Err(Error::new(FsckFailed {
            failed,
            checked: shas.len(),
        }));
    }
    Ok(())
}
