mod config;
mod patcher;

use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{anyhow, Context, Result};
use config::{retrieve_configuration, ReskinConfiguration};
use log::LevelFilter;
use patcher::{
    AdHocCodesign, AnchorStrategy, AppBundle, BackupManager, CodeSigner, LiteralAnchors,
    PatchEngine, PatchReport, Patcher, PlistUtility,
};
use simple_logger::SimpleLogger;
use structopt::StructOpt;

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const PKG_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
const DEFAULT_STYLESHEET: &str = include_str!("../resources/theme.css");

#[derive(Debug, StructOpt)]
#[structopt(name = PKG_NAME, about = PKG_DESCRIPTION, author = PKG_AUTHORS)]
struct Opt {
    #[structopt(short, long, help = "Enable verbose logging")]
    verbose: bool,
    #[structopt(
        parse(from_os_str),
        short,
        long,
        help = "Path to a configuration file (default: <program name>.yml)"
    )]
    config: Option<PathBuf>,
    #[structopt(
        parse(from_os_str),
        short,
        long,
        help = "Path to the application bundle (overrides 'app_path')"
    )]
    app: Option<PathBuf>,
    #[structopt(long, help = "Do not re-sign the application bundle")]
    no_sign: bool,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    #[structopt(about = "Show whether the application is patched")]
    Status,
    #[structopt(about = "Inject the stylesheet into the application")]
    Patch {
        #[structopt(
            parse(from_os_str),
            long,
            help = "CSS file to inject (overrides 'stylesheet')"
        )]
        css: Option<PathBuf>,
    },
    #[structopt(about = "Put the original application files back")]
    Restore,
}

fn run(cli_args: Opt) -> Result<()> {
    let config = retrieve_configuration(cli_args.config.as_deref())?;
    let stylesheet_override = match &cli_args.command {
        Command::Patch { css } => css.clone(),
        _ => None,
    };
    let patcher = build_patcher(&cli_args, config, stylesheet_override)?;
    match cli_args.command {
        Command::Status => {
            let status = patcher.status().context("Failed to retrieve the status")?;
            println!("{}", status);
        }
        Command::Patch { .. } => {
            let report = patcher.patch().context("Failed to patch the application")?;
            match report {
                PatchReport::Applied { backup_created } => {
                    if !backup_created {
                        log::info!("Existing backup kept");
                    }
                    log::info!("Patch applied");
                }
                PatchReport::ManifestResynced => log::info!("Manifest hash updated"),
                PatchReport::AlreadyApplied => log::info!("Nothing to do"),
            }
        }
        Command::Restore => {
            patcher
                .restore()
                .context("Failed to restore the application")?;
        }
    }
    Ok(())
}

fn build_patcher(
    cli_args: &Opt,
    config: ReskinConfiguration,
    stylesheet_override: Option<PathBuf>,
) -> Result<Patcher> {
    let app_path = cli_args
        .app
        .clone()
        .or(config.app_path)
        .ok_or_else(|| anyhow!("No application path given (use --app or 'app_path')"))?;
    let bundle = AppBundle::new(app_path);
    log::debug!("Application bundle: '{}'", bundle.root().to_string_lossy());

    let css = match stylesheet_override.or(config.stylesheet) {
        Some(stylesheet_path) => fs::read_to_string(&stylesheet_path).with_context(|| {
            format!(
                "Failed to read stylesheet '{}'",
                stylesheet_path.to_string_lossy()
            )
        })?,
        None => DEFAULT_STYLESHEET.to_string(),
    };
    let anchors: Box<dyn AnchorStrategy> = match config.anchors {
        Some(anchors) => Box::new(LiteralAnchors {
            definition: anchors.definition,
            call_site: anchors.call_site,
            window: anchors.window,
        }),
        None => Box::new(LiteralAnchors::default()),
    };

    let backup_dir = match config.backup_dir {
        Some(v) => v,
        None => dirs::data_dir()
            .context("Failed to resolve the user data directory")?
            .join(PKG_NAME)
            .join("backups")
            .join(bundle.name()),
    };
    let signer: Option<Box<dyn CodeSigner>> = if cli_args.no_sign || !config.codesign {
        None
    } else {
        Some(Box::new(AdHocCodesign))
    };

    let manifest = PlistUtility::new(bundle.info_plist_path());
    Ok(Patcher::new(
        bundle,
        PatchEngine::new(css, anchors),
        Box::new(manifest),
        BackupManager::new(backup_dir),
    )
    .with_entry_path(config.entry)
    .with_signer(signer))
}

fn main() {
    const SUCCESS_EXIT_CODE: i32 = 0;
    const FAILURE_EXIT_CODE: i32 = 1;

    // Parse CLI arguments
    let cli_args = Opt::from_args();
    // Initialize the logger
    init_logger(cli_args.verbose).expect("Failed to initalize the logger");

    // Run the actual program
    let result = run(cli_args);
    match result {
        Ok(()) => {
            process::exit(SUCCESS_EXIT_CODE);
        }
        Err(err) => {
            log::error!("{:#}", err);
            process::exit(FAILURE_EXIT_CODE);
        }
    }
}

fn init_logger(verbose: bool) -> Result<()> {
    let level_filter = if verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };

    SimpleLogger::new()
        .with_level(LevelFilter::Off)
        .with_module_level(PKG_NAME, level_filter)
        .init()?;
    Ok(())
}
