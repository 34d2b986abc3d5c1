use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use e2sync::sync::{test_ftp, test_telnet};
use e2sync::{backup, logging, Profile, SyncEvent, SyncKind, SyncOptions, Syncer};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to the receiver profile.
    #[arg(short = 'c', long, default_value = "e2sync.toml")]
    config: PathBuf,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a data subset from the receiver.
    Download {
        #[arg(value_enum)]
        kind: KindArg,
    },
    /// Upload a data subset to the receiver.
    Upload {
        #[arg(value_enum)]
        kind: KindArg,
        /// Delete stale userbouquet files from the receiver first.
        #[arg(long)]
        remove_unused: bool,
        /// Skip the local snapshot taken before uploading.
        #[arg(long)]
        no_backup: bool,
    },
    /// Delete picons from the receiver.
    RemovePicons,
    /// Snapshot the local data set.
    Backup,
    /// Test connectivity to one of the receiver's services.
    Test {
        #[arg(value_enum)]
        target: TestTarget,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum KindArg {
    All,
    Bouquets,
    Satellites,
    Picons,
    Epg,
}

impl From<KindArg> for SyncKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::All => SyncKind::All,
            KindArg::Bouquets => SyncKind::Bouquets,
            KindArg::Satellites => SyncKind::Satellites,
            KindArg::Picons => SyncKind::Picons,
            KindArg::Epg => SyncKind::Epg,
        }
    }
}

#[derive(ValueEnum, Clone, Copy)]
enum TestTarget {
    Ftp,
    Telnet,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = logging::init(args.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }
    let profile = match Profile::load(&args.config) {
        Ok(p) => p,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = run(args.command, profile).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command, profile: Profile) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Download { kind } => {
            let syncer = Syncer::new(profile);
            drive(syncer.download(kind.into(), SyncOptions::default())?).await
        }
        Command::Upload {
            kind,
            remove_unused,
            no_backup,
        } => {
            if !no_backup {
                backup::backup_data(&profile.data_dir(), &profile.backup_dir(), false)?;
            }
            let options = SyncOptions {
                remove_unused,
                ..SyncOptions::default()
            };
            let syncer = Syncer::new(profile);
            drive(syncer.upload(kind.into(), options)?).await
        }
        Command::RemovePicons => {
            let syncer = Syncer::new(profile);
            drive(syncer.remove_picons(SyncOptions::default())?).await
        }
        Command::Backup => {
            let snapshot = backup::backup_data(&profile.data_dir(), &profile.backup_dir(), false)?;
            info!("Snapshot: {}", snapshot.display());
            Ok(())
        }
        Command::Test { target } => {
            let status = match target {
                TestTarget::Ftp => test_ftp(&profile).await?,
                TestTarget::Telnet => test_telnet(&profile).await?,
            };
            info!("OK: {}", status);
            Ok(())
        }
    }
}

async fn drive(
    mut events: tokio::sync::mpsc::UnboundedReceiver<SyncEvent>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut failed = false;
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::Progress(message) => info!("{}", message),
            SyncEvent::Error(message) => {
                error!("{}", message);
                failed = true;
            }
            SyncEvent::Done(kind) => info!("Finished: {:?}", kind),
        }
    }
    if failed {
        return Err("sync failed".into());
    }
    Ok(())
}
