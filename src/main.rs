// src/main.rs

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use equo::config::ResolverConfig;
use equo::repository::{
    self, INSTALLED_REPOSITORY, MatchFilter, PackageMatch, PackageRepository,
};
use equo::resolver::{
    InstallOptions, MatchOptions, RemovalOptions, RepositorySet, Resolver,
};
use std::io;
use tracing::info;

const DEFAULT_DB_PATH: &str = "/var/lib/equo/equo.db";

#[derive(Parser)]
#[command(name = "equo")]
#[command(author, version, about = "Binary package manager: dependency resolution and install/remove queues", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the equo database
    Init {
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Add a new repository
    RepoAdd {
        /// Repository name
        name: String,
        /// Repository URL
        url: String,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        /// Priority (lower = preferred)
        #[arg(short, long, default_value = "0")]
        priority: i32,
        /// Disable repository after adding
        #[arg(long)]
        disabled: bool,
    },
    /// List repositories
    RepoList {
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        /// Show all repositories (including disabled)
        #[arg(short, long)]
        all: bool,
    },
    /// Remove a repository
    RepoRemove {
        name: String,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Enable a repository
    RepoEnable {
        name: String,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Disable a repository
    RepoDisable {
        name: String,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Replace a repository's packages with a JSON index
    RepoImport {
        /// Repository name
        name: String,
        /// Path to the JSON repository index
        index: String,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Replace the installed packages with a JSON index
    InstalledImport {
        /// Path to the JSON index
        index: String,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Match an atom against the repositories
    Match {
        atom: String,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        /// Resolver configuration file (JSON)
        #[arg(short, long)]
        config: Option<String>,
        /// Required slot
        #[arg(short, long)]
        slot: Option<String>,
        /// Show every match, from every repository
        #[arg(short, long)]
        multi: bool,
    },
    /// Compute the install queue of one or more atoms
    Install {
        /// Atoms to install
        #[arg(required = true)]
        atoms: Vec<String>,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        /// Resolver configuration file (JSON)
        #[arg(short, long)]
        config: Option<String>,
        /// Reinstall packages whose digest changed
        #[arg(long)]
        deep: bool,
        /// Accept any installed version as satisfying a dependency
        #[arg(long)]
        relaxed: bool,
        /// Pull in every dependency, even satisfied ones
        #[arg(long)]
        empty: bool,
        /// Include build dependencies
        #[arg(long)]
        build: bool,
        /// Only walk direct dependencies
        #[arg(long)]
        no_recursive: bool,
        /// Install dependencies only
        #[arg(long)]
        only_deps: bool,
    },
    /// Compute the removal queue of one or more installed atoms
    Remove {
        /// Installed atoms to remove
        #[arg(required = true)]
        atoms: Vec<String>,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        /// Resolver configuration file (JSON)
        #[arg(short, long)]
        config: Option<String>,
        /// Also remove dependencies left unused
        #[arg(long)]
        deep: bool,
        /// Only remove direct reverse dependencies
        #[arg(long)]
        no_recursive: bool,
        /// With --deep, remove every direct dependency
        #[arg(long)]
        empty: bool,
        /// Allow removing system packages
        #[arg(long)]
        force_system: bool,
    },
    /// Show installed packages depending on an installed package
    Rdepends {
        atom: String,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

fn open_resolver(db_path: &str, config: Option<&str>) -> Result<Resolver> {
    let config = match config {
        Some(path) => ResolverConfig::load(path)?,
        None => ResolverConfig::default(),
    };
    let config = config.with_overrides(|name| std::env::var(name).ok());
    let repositories = RepositorySet::open_database(db_path)?;
    info!(
        "Resolving against {} repositories: {}",
        repositories.len(),
        repositories.repository_names().join(", ")
    );
    Ok(Resolver::new(repositories, config)?)
}

/// Human-readable atom of a match
fn describe(resolver: &Resolver, pkg: &PackageMatch) -> Result<String> {
    let atom = resolver
        .open_repository(&pkg.repository)?
        .retrieve_atom(pkg.package_id)?
        .unwrap_or_else(|| "N/A".to_string());
    Ok(format!("{} ({})", atom, pkg))
}

fn installed_id(resolver: &Resolver, atom: &str) -> Result<i64> {
    resolver
        .installed()
        .atom_match(atom, &MatchFilter::default())?
        .ok_or_else(|| anyhow::anyhow!("No installed package matches '{}'", atom))
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { db_path }) => {
            info!("Initializing equo database at: {}", db_path);
            equo::db::init(&db_path)?;
            println!("Database initialized successfully at: {}", db_path);
            Ok(())
        }
        Some(Commands::RepoAdd {
            name,
            url,
            db_path,
            priority,
            disabled,
        }) => {
            let conn = equo::db::open(&db_path)?;
            let repo = repository::add_repository(&conn, name, url, !disabled, priority)?;
            println!("Added repository '{}' (priority {})", repo.name, repo.priority);
            Ok(())
        }
        Some(Commands::RepoList { db_path, all }) => {
            let conn = equo::db::open(&db_path)?;
            let repos = if all {
                equo::db::models::Repository::list_all(&conn)?
            } else {
                equo::db::models::Repository::list_enabled(&conn)?
            };

            if repos.is_empty() {
                println!("No repositories configured");
                return Ok(());
            }
            for repo in repos {
                println!(
                    "{:<20} {:>4} {:<8} {} (synced: {})",
                    repo.name,
                    repo.priority,
                    if repo.enabled { "enabled" } else { "disabled" },
                    repo.url,
                    repo.last_sync.as_deref().unwrap_or("never")
                );
            }
            Ok(())
        }
        Some(Commands::RepoRemove { name, db_path }) => {
            let conn = equo::db::open(&db_path)?;
            repository::remove_repository(&conn, &name)?;
            println!("Removed repository '{}'", name);
            Ok(())
        }
        Some(Commands::RepoEnable { name, db_path }) => {
            let conn = equo::db::open(&db_path)?;
            repository::set_repository_enabled(&conn, &name, true)?;
            println!("Enabled repository '{}'", name);
            Ok(())
        }
        Some(Commands::RepoDisable { name, db_path }) => {
            let conn = equo::db::open(&db_path)?;
            repository::set_repository_enabled(&conn, &name, false)?;
            println!("Disabled repository '{}'", name);
            Ok(())
        }
        Some(Commands::RepoImport { name, index, db_path }) => {
            let index = repository::load_index(&index)?;
            let mut conn = equo::db::open(&db_path)?;
            let count = repository::import_index(&mut conn, &name, &index)?;
            println!("Imported {} packages into '{}'", count, name);
            Ok(())
        }
        Some(Commands::InstalledImport { index, db_path }) => {
            let index = repository::load_index(&index)?;
            let mut conn = equo::db::open(&db_path)?;
            let count = repository::import_index(&mut conn, INSTALLED_REPOSITORY, &index)?;
            println!("Imported {} installed packages", count);
            Ok(())
        }
        Some(Commands::Match {
            atom,
            db_path,
            config,
            slot,
            multi,
        }) => {
            let resolver = open_resolver(&db_path, config.as_deref())?;
            let mut options = MatchOptions {
                slot,
                ..MatchOptions::default()
            };

            if multi {
                options.multi_repo = true;
                let matches = resolver.atom_match_multi(&atom, &options)?;
                if matches.is_empty() {
                    println!("No match for '{}'", atom);
                }
                for pkg in &matches {
                    println!("{}", describe(&resolver, pkg)?);
                }
                return Ok(());
            }

            match resolver.atom_match(&atom, &options)? {
                Some(pkg) => println!("{}", describe(&resolver, &pkg)?),
                None => println!("No match for '{}'", atom),
            }
            Ok(())
        }
        Some(Commands::Install {
            atoms,
            db_path,
            config,
            deep,
            relaxed,
            empty,
            build,
            no_recursive,
            only_deps,
        }) => {
            let resolver = open_resolver(&db_path, config.as_deref())?;

            let mut requested = Vec::new();
            for atom in &atoms {
                let pkg = resolver
                    .atom_match(atom, &MatchOptions::default())?
                    .ok_or_else(|| anyhow::anyhow!("No package matches '{}'", atom))?;
                requested.push(pkg);
            }

            let options = InstallOptions {
                empty,
                deep,
                relaxed,
                build,
                recursive: !no_recursive,
                only_deps,
            };
            let queue = resolver.get_install_queue(&requested, &options)?;

            if queue.install.is_empty() && queue.removal.is_empty() {
                println!("Nothing to do");
                return Ok(());
            }
            for package_id in &queue.removal {
                let pkg = PackageMatch::installed(*package_id);
                println!("  remove   {}", describe(&resolver, &pkg)?);
            }
            for pkg in &queue.install {
                let action = resolver.package_action(pkg)?;
                println!("  {:<9}{}", action, describe(&resolver, pkg)?);
            }
            println!(
                "{} to install, {} to remove",
                queue.install.len(),
                queue.removal.len()
            );
            Ok(())
        }
        Some(Commands::Remove {
            atoms,
            db_path,
            config,
            deep,
            no_recursive,
            empty,
            force_system,
        }) => {
            let resolver = open_resolver(&db_path, config.as_deref())?;

            let mut package_ids = Vec::new();
            for atom in &atoms {
                package_ids.push(installed_id(&resolver, atom)?);
            }

            let options = RemovalOptions {
                deep,
                recursive: !no_recursive,
                empty,
                system_packages: !force_system,
            };
            let queue = resolver.get_removal_queue(&package_ids, &options)?;
            for package_id in &queue {
                let pkg = PackageMatch::installed(*package_id);
                println!("  remove   {}", describe(&resolver, &pkg)?);
            }
            println!("{} to remove", queue.len());
            Ok(())
        }
        Some(Commands::Rdepends { atom, db_path }) => {
            let resolver = open_resolver(&db_path, None)?;
            let package_id = installed_id(&resolver, &atom)?;
            let installed = resolver.installed();

            let reverse = installed.retrieve_reverse_dependencies(package_id, &[])?;
            if reverse.is_empty() {
                println!("Nothing depends on '{}'", atom);
                return Ok(());
            }
            for (dependent, dependency) in reverse {
                let name = installed
                    .retrieve_atom(dependent)?
                    .unwrap_or_else(|| "N/A".to_string());
                println!("  {} (via {})", name, dependency);
            }
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "equo", &mut io::stdout());
            Ok(())
        }
        None => {
            // No command provided, show help
            println!("equo v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'equo --help' for usage information");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_install_flags() {
        let cli = Cli::try_parse_from([
            "equo",
            "install",
            "app/foo",
            "app/bar",
            "--deep",
            "--no-recursive",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Install {
                atoms,
                deep,
                no_recursive,
                relaxed,
                db_path,
                ..
            }) => {
                assert_eq!(atoms, vec!["app/foo", "app/bar"]);
                assert!(deep);
                assert!(no_recursive);
                assert!(!relaxed);
                assert_eq!(db_path, DEFAULT_DB_PATH);
            }
            _ => panic!("expected install command"),
        }
    }

    #[test]
    fn test_remove_requires_atoms() {
        assert!(Cli::try_parse_from(["equo", "remove"]).is_err());
    }

    #[test]
    fn test_describe_missing_package() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        equo::db::init(db_path).unwrap();

        let resolver = open_resolver(db_path, None).unwrap();
        let text = describe(&resolver, &PackageMatch::installed(42)).unwrap();
        assert_eq!(text, "N/A (42@__system__)");
        assert!(installed_id(&resolver, "app/foo").is_err());
    }
}
