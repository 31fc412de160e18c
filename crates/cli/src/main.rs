use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use fhir::{normalize, BundleValidator, ExternalReferenceRegistry, TerminologyRegistry};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use uhi_codec::{Envelope, KeyId, SignedEnvelope, SigningKeyPair, TrustedKeyRegistry, Verifier};

#[derive(Parser)]
#[command(name = "uhi")]
#[command(about = "UHI gateway operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an ed25519 signing key
    Keygen {
        /// Subscriber id the key belongs to
        subscriber_id: String,
        /// Unique key id within the subscriber
        #[arg(long, default_value = "k1")]
        unique_key_id: String,
    },
    /// Sign an envelope file and print the signed envelope
    Sign {
        /// Envelope JSON file
        envelope: PathBuf,
        /// Base64 32-byte seed
        #[arg(long, env = "UHI_SIGNING_KEY", hide_env_values = true)]
        seed: String,
        /// Subscriber id of the signer (defaults to the envelope's sender)
        #[arg(long)]
        subscriber_id: Option<String>,
        #[arg(long, default_value = "k1")]
        unique_key_id: String,
    },
    /// Verify a signed envelope file against a trusted-keys registry
    Verify {
        /// Signed envelope JSON file
        envelope: PathBuf,
        /// Trusted keys YAML file
        #[arg(long, env = "UHI_TRUSTED_KEYS_FILE")]
        trusted_keys: PathBuf,
        /// Verification instant (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Validate a FHIR bundle file and print its canonical form
    ValidateBundle {
        /// Bundle JSON file
        bundle: PathBuf,
        /// Additional terminology YAML file
        #[arg(long, env = "UHI_TERMINOLOGY_FILE")]
        terminology: Option<PathBuf>,
        /// External references YAML file
        #[arg(long, env = "UHI_EXTERNAL_REFERENCES_FILE")]
        external_references: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}

/// Runs one command. `Ok(false)` means the input was checked and rejected.
fn run(command: Commands) -> Result<bool, Box<dyn std::error::Error>> {
    match command {
        Commands::Keygen {
            subscriber_id,
            unique_key_id,
        } => {
            let key = SigningKeyPair::generate(KeyId::new(subscriber_id, unique_key_id)?);
            println!("{}", keygen_report(&key));
            Ok(true)
        }
        Commands::Sign {
            envelope,
            seed,
            subscriber_id,
            unique_key_id,
        } => {
            let envelope = Envelope::parse(&read(&envelope)?)?;
            let subscriber_id = subscriber_id.unwrap_or_else(|| sender(&envelope).to_owned());
            let key = SigningKeyPair::from_base64_seed(
                KeyId::new(subscriber_id, unique_key_id)?,
                &seed,
            )?;
            let signed = uhi_codec::sign(envelope, &key)?;
            println!("{}", serde_json::to_string_pretty(signed.raw())?);
            Ok(true)
        }
        Commands::Verify {
            envelope,
            trusted_keys,
            at,
        } => {
            let registry = TrustedKeyRegistry::new();
            registry.load_file(&trusted_keys)?;
            let raw: serde_json::Value = serde_json::from_str(&read(&envelope)?)?;
            let signed = SignedEnvelope::from_value(raw)?;
            let verifier = Verifier::new(Arc::new(registry));
            match verifier.verify(&signed, at.unwrap_or_else(Utc::now)) {
                Ok(verified) => {
                    println!(
                        "OK: {} {} signed by {}",
                        verified.context().action,
                        verified.context().message_id,
                        verified.key_id()
                    );
                    Ok(true)
                }
                Err(e) => {
                    println!("REJECTED: {}", e);
                    Ok(false)
                }
            }
        }
        Commands::ValidateBundle {
            bundle,
            terminology,
            external_references,
        } => {
            let terminology_registry = TerminologyRegistry::with_builtin();
            if let Some(path) = terminology {
                terminology_registry.load_file(&path)?;
            }
            let external = ExternalReferenceRegistry::new();
            if let Some(path) = external_references {
                external.load_file(&path)?;
            }
            let validator = BundleValidator::new(Arc::new(terminology_registry), Arc::new(external));
            match validator.validate_str(&read(&bundle)?) {
                Ok(validated) => {
                    let canonical = normalize(&validated);
                    eprintln!(
                        "Valid {} bundle {} (sha256 {})",
                        canonical.bundle_type.as_str(),
                        canonical.bundle_id,
                        canonical.sha256
                    );
                    println!("{}", canonical.json);
                    Ok(true)
                }
                Err(errors) => {
                    println!("{} validation error(s):", errors.len());
                    for error in errors {
                        println!("  {}", error);
                    }
                    Ok(false)
                }
            }
        }
    }
}

fn read(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e).into())
}

/// The participant that sends `envelope`: the BAP for requests, the BPP for callbacks.
fn sender(envelope: &Envelope) -> &str {
    let ctx = &envelope.context;
    match (&ctx.bpp_id, ctx.action.is_callback()) {
        (Some(bpp_id), true) => bpp_id,
        _ => &ctx.bap_id,
    }
}

/// Seed for `UHI_SIGNING_KEY` plus the registry entry counterparties need.
fn keygen_report(key: &SigningKeyPair) -> String {
    let key_id = key.key_id();
    format!(
        "# UHI_SIGNING_KEY (keep secret)\n{seed}\n\n# trusted keys entry\nkeys:\n  - subscriber_id: {sub}\n    unique_key_id: {unique}\n    public_key: {public}",
        seed = key.seed_base64(),
        sub = key_id.subscriber_id(),
        unique = key_id.unique_key_id(),
        public = key.public_key_base64(),
    )
}
