// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use clap::Parser;
use pcr_quote::attest::ALG_SHA256;
use pcr_quote::keys::KeyAlgorithm;
use pcr_quote::quote::{self, Progress, Quote, QuoteConfig, QuoteError, DEBUG_PCR};
use pcr_quote::open_device;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCTI configuration, e.g. "device:/dev/tpmrm0" or "mssim:host=localhost,port=2321"
    #[arg(short, long, global = true)]
    tcti: Option<String>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Copy, Clone, clap::ValueEnum)]
enum Algorithm {
    Rsa,
    Ecc,
}

impl From<Algorithm> for KeyAlgorithm {
    fn from(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Rsa => KeyAlgorithm::Rsa,
            Algorithm::Ecc => KeyAlgorithm::Ecc,
        }
    }
}

#[derive(clap::Subcommand)]
enum Action {
    /// Create EK, SRK and AIK and quote PCRs of the SHA-256 bank
    Quote {
        /// Key algorithm of the EK, SRK and AIK
        #[arg(short, long, value_enum, default_value_t = Algorithm::Rsa)]
        algorithm: Algorithm,

        /// PCR to include in the quote, may be repeated
        #[arg(short, long = "pcr", default_values_t = vec![DEBUG_PCR])]
        pcrs: Vec<u8>,

        /// A nonce to use for the quote
        #[arg(short, long)]
        nonce: Option<String>,

        /// Auth value of the Storage Root Key
        #[arg(long)]
        storage_auth: Option<String>,

        /// Auth value of the Attestation Identity Key
        #[arg(long)]
        usage_auth: Option<String>,

        /// Write the quote to a file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Print a quote written by `quote --out`
    Parse {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Verify a quote written by `quote --out` against its bundled AIK
    #[cfg(feature = "verifier")]
    Verify {
        #[arg(short, long)]
        file: PathBuf,

        /// The nonce the quote was requested with
        #[arg(short, long, default_value = "")]
        nonce: String,
    },
    /// List transient objects and sessions loaded in the TPM
    Handles,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let tcti = args.tcti.as_deref();

    let result = match args.action {
        Action::Quote {
            algorithm,
            pcrs,
            nonce,
            storage_auth,
            usage_auth,
            out,
        } => {
            let defaults = QuoteConfig::default();
            let config = QuoteConfig {
                algorithm: algorithm.into(),
                pcrs,
                qualifying_data: nonce.map(String::into_bytes).unwrap_or_default(),
                storage_auth: storage_auth.map_or(defaults.storage_auth, String::into_bytes),
                usage_auth: usage_auth.map_or(defaults.usage_auth, String::into_bytes),
            };
            return run_quote(tcti, &config, out.as_deref());
        }
        Action::Parse { file } => parse(&file),
        #[cfg(feature = "verifier")]
        Action::Verify { file, nonce } => verify(&file, nonce.as_bytes()),
        Action::Handles => handles(tcti),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_quote(tcti: Option<&str>, config: &QuoteConfig, out: Option<&Path>) -> ExitCode {
    println!("Demo of generating signed PCR measurement (TPM2.0 Quote)");
    let mut device = match open_device(tcti) {
        Ok(device) => device,
        Err(e) => {
            println!("device init failed: {e}");
            return ExitCode::from(1);
        }
    };
    println!("device init: success");

    let quote = match quote::get_quote_with_progress(&mut device, config, print_progress) {
        Ok(quote) => quote,
        Err(e) => return report_failure(&e),
    };

    if let Some(path) = out {
        if let Err(e) = write_quote(&quote, path) {
            println!("writing {} failed: {e}", path.display());
            return ExitCode::from(1);
        }
        println!("quote written to {}", path.display());
    }

    if let Err(e) = device.close() {
        return report_failure(&QuoteError::from(e));
    }
    ExitCode::SUCCESS
}

fn report_failure(e: &QuoteError) -> ExitCode {
    match e.response_code() {
        Some(rc) => println!("{e} (response code 0x{rc:x})"),
        None => println!("{e}"),
    }
    ExitCode::from(e.exit_code())
}

fn print_progress(progress: Progress) {
    match progress {
        Progress::KeyCreated {
            role,
            handle,
            public_size,
        } => println!("create {role}: 0x{handle:x} ({public_size} bytes)"),
        Progress::SessionStarted { handle } => {
            println!("start auth session: sessionHandle 0x{handle:x}")
        }
        Progress::Quoted { attested } => {
            println!("quote: success");
            println!("TPM with signature attests (type 0x{:x}):", attested.attest_type);
            let count = attested.quote().map_or(0, |info| info.selection_count());
            println!("\tTPM signed {count} PCR");
        }
    }
}

fn write_quote(quote: &Quote, path: &Path) -> Result<(), Box<dyn Error>> {
    fs::write(path, quote.to_bytes()?)?;
    Ok(())
}

fn read_quote(path: &Path) -> Result<Quote, Box<dyn Error>> {
    let bytes = fs::read(path)?;
    Ok(Quote::from_bytes(&bytes)?)
}

fn parse(path: &Path) -> Result<(), Box<dyn Error>> {
    let quote = read_quote(path)?;
    let attested = quote.attested()?;

    let origin = if attested.is_tpm_generated() {
        "TPM generated"
    } else {
        "not generated by the TPM"
    };
    println!("magic: 0x{:08X} ({origin})", attested.magic);
    println!("type: 0x{:04x}", attested.attest_type);
    println!("qualified signer: {}", hex::encode(&attested.qualified_signer));
    println!("extra data: {}", hex::encode(&attested.extra_data));
    println!(
        "clock: {} (resets {}, restarts {}, safe {})",
        attested.clock_info.clock,
        attested.clock_info.reset_count,
        attested.clock_info.restart_count,
        attested.clock_info.safe
    );
    println!("firmware version: 0x{:016x}", attested.firmware_version);

    if let Some(info) = attested.quote() {
        println!("selected PCRs (sha256): {:?}", info.selected_pcrs(ALG_SHA256));
        println!("pcr digest: {}", hex::encode(&info.pcr_digest));
    }
    for pcr in quote.pcrs_sha256() {
        println!("pcr value: {}", hex::encode(pcr));
    }
    Ok(())
}

#[cfg(feature = "verifier")]
fn verify(path: &Path, nonce: &[u8]) -> Result<(), Box<dyn Error>> {
    let quote = read_quote(path)?;
    quote.verify(nonce)?;
    println!("quote verified");
    Ok(())
}

fn handles(tcti: Option<&str>) -> Result<(), Box<dyn Error>> {
    let mut device = open_device(tcti)?;
    for handle in device.transient_handles()? {
        println!("transient: 0x{handle:08x}");
    }
    for handle in device.loaded_sessions()? {
        println!("session: 0x{handle:08x}");
    }
    Ok(())
}
