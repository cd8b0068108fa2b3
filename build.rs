// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

const DEFAULT_DB_PATH: &str = "/var/lib/equo/equo.db";

fn db_path_arg() -> Arg {
    Arg::new("db_path")
        .short('d')
        .long("db-path")
        .value_name("PATH")
        .default_value(DEFAULT_DB_PATH)
        .help("Database path")
}

fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .help("Resolver configuration file (JSON)")
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
}

fn build_cli() -> Command {
    Command::new("equo")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Equo Contributors")
        .about("Binary package manager: dependency resolution and install/remove queues")
        .subcommand_required(false)
        .subcommand(
            Command::new("init")
                .about("Initialize the equo database")
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("repo-add")
                .about("Add a new repository")
                .arg(Arg::new("name").required(true).help("Repository name"))
                .arg(Arg::new("url").required(true).help("Repository URL"))
                .arg(db_path_arg())
                .arg(
                    Arg::new("priority")
                        .short('p')
                        .long("priority")
                        .default_value("0")
                        .help("Priority (lower = preferred)"),
                )
                .arg(flag("disabled", "Disable repository after adding")),
        )
        .subcommand(
            Command::new("repo-list")
                .about("List repositories")
                .arg(db_path_arg())
                .arg(
                    Arg::new("all")
                        .short('a')
                        .long("all")
                        .action(ArgAction::SetTrue)
                        .help("Show all repositories (including disabled)"),
                ),
        )
        .subcommand(
            Command::new("repo-remove")
                .about("Remove a repository")
                .arg(Arg::new("name").required(true).help("Repository name"))
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("repo-enable")
                .about("Enable a repository")
                .arg(Arg::new("name").required(true).help("Repository name"))
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("repo-disable")
                .about("Disable a repository")
                .arg(Arg::new("name").required(true).help("Repository name"))
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("repo-import")
                .about("Replace a repository's packages with a JSON index")
                .arg(Arg::new("name").required(true).help("Repository name"))
                .arg(Arg::new("index").required(true).help("Path to the JSON repository index"))
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("installed-import")
                .about("Replace the installed packages with a JSON index")
                .arg(Arg::new("index").required(true).help("Path to the JSON index"))
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("match")
                .about("Match an atom against the repositories")
                .arg(Arg::new("atom").required(true).help("Package atom"))
                .arg(db_path_arg())
                .arg(config_arg())
                .arg(Arg::new("slot").short('s').long("slot").help("Required slot"))
                .arg(
                    Arg::new("multi")
                        .short('m')
                        .long("multi")
                        .action(ArgAction::SetTrue)
                        .help("Show every match, from every repository"),
                ),
        )
        .subcommand(
            Command::new("install")
                .about("Compute the install queue of one or more atoms")
                .arg(
                    Arg::new("atoms")
                        .required(true)
                        .num_args(1..)
                        .help("Atoms to install"),
                )
                .arg(db_path_arg())
                .arg(config_arg())
                .arg(flag("deep", "Reinstall packages whose digest changed"))
                .arg(flag("relaxed", "Accept any installed version as satisfying a dependency"))
                .arg(flag("empty", "Pull in every dependency, even satisfied ones"))
                .arg(flag("build", "Include build dependencies"))
                .arg(flag("no-recursive", "Only walk direct dependencies"))
                .arg(flag("only-deps", "Install dependencies only")),
        )
        .subcommand(
            Command::new("remove")
                .about("Compute the removal queue of one or more installed atoms")
                .arg(
                    Arg::new("atoms")
                        .required(true)
                        .num_args(1..)
                        .help("Installed atoms to remove"),
                )
                .arg(db_path_arg())
                .arg(config_arg())
                .arg(flag("deep", "Also remove dependencies left unused"))
                .arg(flag("no-recursive", "Only remove direct reverse dependencies"))
                .arg(flag("empty", "With --deep, remove every direct dependency"))
                .arg(flag("force-system", "Allow removing system packages")),
        )
        .subcommand(
            Command::new("rdepends")
                .about("Show installed packages depending on an installed package")
                .arg(Arg::new("atom").required(true).help("Installed package atom"))
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("equo.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
