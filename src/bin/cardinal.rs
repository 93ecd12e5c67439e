use anyhow::{anyhow, Context as _, Result};
use clap::Parser as _;
use owo_colors::OwoColorize as _;
use pcsc::Context;
use tracing::{debug, trace, trace_span};

use cardinal::dictionary;
use cardinal::session::Session;
use cardinal::transport::PcscTransport;

#[derive(clap::Parser, Debug)]
#[command(version, about = "EMV chip card session toolkit")]
struct Args {
    /// Increase log level.
    #[arg(short, long, action=clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log level.
    #[arg(short, long, action=clap::ArgAction::Count)]
    quiet: u8,

    /// Set log level directly; overrides -v/-q.
    #[arg(long)]
    loglevel: Option<String>,

    /// Use a specific reader (from `readers`).
    #[arg(short, long)]
    reader: Option<String>,

    /// Cardholder PIN, for commands that verify it.
    #[arg(long)]
    pin: Option<String>,

    /// Redact sensitive fields (PAN, Track 2, cardholder name) in output.
    /// On by default; pass --no-redact to see them in the clear.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    redact: bool,

    /// Show sensitive fields in the clear.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_redact: bool,

    /// Command.
    #[command(subcommand)]
    command: Command,
}

impl Args {
    fn redact(&self) -> bool {
        !self.no_redact
    }
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print the crate version.
    Version,

    /// List connected readers.
    Readers,

    /// Select the card's application directory and print its FCI.
    Info,

    /// List applications found via PSE/PPSE (or the built-in AID scan).
    Listapps,

    /// Select an application (by index from `listapps`) and verify a PIN.
    Verifypin { app_index: usize },

    /// Select an application and compute a CAP one-time code.
    Cap {
        #[arg(long)]
        challenge: Option<u64>,
        #[arg(long)]
        amount: Option<u64>,
    },
}

/// 0 success, 2 missing precondition (no reader, no PIN), 3 argument error.
mod exit {
    pub const MISSING_PRECONDITION: i32 = 2;
    pub const ARGUMENT_ERROR: i32 = 3;
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    init_logging(&args);
    trace!(?args, "starting up");

    match run(&args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            let code = e
                .downcast_ref::<CliError>()
                .map(CliError::exit_code)
                .unwrap_or(1);
            std::process::ExitCode::from(code as u8)
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("no PC/SC reader connected")]
    NoReader,
    #[error("this command requires --pin")]
    NoPin,
    #[error("app_index {0} is out of range")]
    AppIndexOutOfRange(usize),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::NoReader | CliError::NoPin => exit::MISSING_PRECONDITION,
            CliError::AppIndexOutOfRange(_) => exit::ARGUMENT_ERROR,
        }
    }
}

fn run(args: &Args) -> Result<()> {
    match &args.command {
        Command::Version => {
            println!("cardinal {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Readers => cmd_readers(),
        Command::Info => cmd_info(args),
        Command::Listapps => cmd_listapps(args),
        Command::Verifypin { app_index } => cmd_verifypin(args, *app_index),
        Command::Cap { challenge, amount } => cmd_cap(args, *challenge, *amount),
    }
}

fn cmd_readers() -> Result<()> {
    let span = trace_span!("readers");
    let _enter = span.enter();

    let ctx = Context::establish(pcsc::Scope::User)?;
    let mut readers_buf = [0; 2048];
    for name in ctx.list_readers(&mut readers_buf)? {
        println!("{}", name.to_str()?);
    }
    Ok(())
}

fn cmd_info(args: &Args) -> Result<()> {
    let mut session = connect(args)?;
    let entries = session.list_applications()?;
    for entry in &entries {
        println!(
            "{}  {}",
            hex::encode_upper(&entry.aid).cyan(),
            entry.label.as_deref().unwrap_or("-")
        );
    }

    let Some(first) = entries.first() else {
        println!("{}", "no applications found".yellow());
        return Ok(());
    };
    session.select_application(&first.aid)?;
    print_fci(&session, args.redact());

    match session.get_metadata() {
        Ok(meta) => print_metadata(&meta),
        Err(e) if e.is_recoverable_during_discovery() => {
            debug!(%e, "metadata query failed, skipping");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn cmd_listapps(args: &Args) -> Result<()> {
    let mut session = connect(args)?;
    let entries = session.list_applications()?;
    for (i, entry) in entries.iter().enumerate() {
        println!(
            "[{i}] {}  {}",
            hex::encode_upper(&entry.aid).cyan(),
            entry.label.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn cmd_verifypin(args: &Args, app_index: usize) -> Result<()> {
    let pin = args.pin.clone().ok_or(CliError::NoPin)?;
    let mut session = connect(args)?;
    let entries = session.list_applications()?;
    let entry = entries
        .get(app_index)
        .ok_or(CliError::AppIndexOutOfRange(app_index))?;
    session.select_application(&entry.aid)?;
    session.verify_pin(&pin)?;
    println!("{}", "PIN verified".green());
    Ok(())
}

fn cmd_cap(args: &Args, challenge: Option<u64>, amount: Option<u64>) -> Result<()> {
    let pin = args.pin.clone().ok_or(CliError::NoPin)?;
    let mut session = connect(args)?;
    let entries = session.list_applications()?;
    let entry = entries.first().ok_or_else(|| anyhow!("no applications found"))?;
    session.select_application(&entry.aid)?;
    session.verify_pin(&pin)?;

    let request = cardinal::cap::build_arqc_request(amount, challenge)?;
    let response = session.generate_ac(request)?;
    let code = cardinal::cap::extract_cap_value(&response)?;
    println!("{}", code.bold());
    Ok(())
}

fn print_fci(session: &Session<PcscTransport>, redact: bool) {
    let Some(adf) = session.selected_application() else {
        return;
    };
    println!(
        "DF name: {}",
        hex::encode_upper(adf.fci.df_name.clone().unwrap_or_default())
    );
    if let Some(sfi) = adf.fci.sfi_of_directory_ef {
        println!("Directory SFI: {sfi}");
    }
    if let Some(lang) = &adf.fci.language_preference {
        println!("Language preference: {lang}");
    }
    for (tag, value) in &adf.fci.extra {
        let name = dictionary::lookup(tag).map(|i| i.name).unwrap_or("unknown");
        println!("{tag} ({name}): {}", dictionary::render(tag, value, redact));
    }
}

fn print_metadata(meta: &cardinal::session::Metadata) {
    if let Some(atc) = &meta.atc {
        println!("ATC: {}", cardinal::util::format_hex_grouped(atc));
    }
    if let Some(n) = meta.pin_try_counter {
        println!("PIN try counter: {n}");
    }
    if let Some(atc) = &meta.last_online_atc {
        println!("Last online ATC: {}", cardinal::util::format_hex_grouped(atc));
    }
}

fn connect(args: &Args) -> Result<Session<PcscTransport>> {
    let ctx = Context::establish(pcsc::Scope::User)?;
    let card = select_card(&ctx, &args.reader)?;
    Ok(Session::new(PcscTransport::new(card)))
}

fn select_card(ctx: &Context, name_: &Option<String>) -> Result<pcsc::Card> {
    let span = trace_span!("select_card", name_);
    let _enter = span.enter();

    Ok(if let Some(name) = name_ {
        debug!(name, "connecting to named reader");
        ctx.connect(
            std::ffi::CString::new(name.clone())?.as_c_str(),
            pcsc::ShareMode::Shared,
            pcsc::Protocols::ANY,
        )
        .with_context(|| format!("connecting to reader {name}"))?
    } else {
        let mut readers_buf = [0; 2048];
        debug!("listing available readers");
        let name = ctx
            .list_readers(&mut readers_buf)?
            .next()
            .ok_or(CliError::NoReader)?;

        debug!(?name, "connecting to first available reader");
        ctx.connect(name, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)?
    })
}

fn init_logging(args: &Args) {
    let level = match args.loglevel.as_deref() {
        Some("info") => tracing::Level::INFO,
        Some("debug") => tracing::Level::DEBUG,
        Some("warn") => tracing::Level::WARN,
        _ => match 2 + args.verbose as i8 - args.quiet as i8 {
            i8::MIN..=0 => tracing::Level::ERROR,
            1 => tracing::Level::WARN,
            2 => tracing::Level::INFO,
            3 => tracing::Level::DEBUG,
            4..=i8::MAX => tracing::Level::TRACE,
        },
    };

    tracing_subscriber::fmt()
        .without_time()
        .with_target(false)
        .with_max_level(level)
        .init();
}
