//! X25519 identity key tool.
//!
//! Prints the base64url public key for an identity, generating and
//! storing the private key on first use:
//!
//! ```text
//! stcp-keygen                 # use ./id_stcp, creating it if missing
//! stcp-keygen -f server.key   # use another key file
//! stcp-keygen -k <base64url>  # derive from a given private key
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use stcp::key;

#[derive(Debug, Parser)]
#[command(name = "stcp-keygen", version, about = "Generate or derive an X25519 identity key")]
struct Args {
    /// Private key storage path.
    #[arg(short = 'f', value_name = "PATH", default_value = "id_stcp")]
    file: PathBuf,

    /// Derive the public key from this base64url private key instead of
    /// using the key file.
    #[arg(short = 'k', value_name = "KEY")]
    key: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(public) => {
            println!("{public}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("stcp-keygen: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> std::io::Result<String> {
    let private_key = match &args.key {
        Some(text) => key::decode(text)?,
        None => key::generate(&args.file)?,
    };
    Ok(key::encode(&key::public_key(&private_key)))
}
