use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use serde::Serialize;
use snafu::ResultExt as _;
use stackable_csr_operator::{
    admission::CsrStrategy,
    api::CertificateSigningRequest,
    request::{self, CanonicalFields},
    signer::local::CertificateAuthority,
};
use tracing::{info, level_filters::LevelFilter};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a PEM-encoded PKCS#10 request, and print the fields that would be derived from it
    Inspect(InspectArgs),

    /// Issue a certificate for a PEM-encoded PKCS#10 request
    Sign(SignArgs),

    /// Strip a JSON CertificateSigningRequest down to what is needed to create it again
    Export(ExportArgs),
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// The request to inspect
    #[arg(long, env)]
    request: PathBuf,
}

#[derive(Parser, Debug)]
struct SignArgs {
    /// The request to sign
    #[arg(long, env)]
    request: PathBuf,

    /// PEM-encoded certificate of the signing CA
    #[arg(long, env)]
    ca_cert: PathBuf,

    /// PEM-encoded private key of the signing CA
    #[arg(long, env)]
    ca_key: PathBuf,

    /// How many days the issued certificate should be valid for, at most until the CA expires
    #[arg(long, env, default_value_t = 365)]
    lifetime_days: u32,

    /// Where to write the PEM-encoded certificate to, printed to stdout if not set
    #[arg(long, env)]
    out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ExportArgs {
    /// The JSON-encoded CertificateSigningRequest to export
    #[arg(long, env)]
    csr: PathBuf,

    /// Keep the identity of the original requester
    #[arg(long)]
    exact: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Inspection {
    fingerprint: String,
    #[serde(flatten)]
    fields: CanonicalFields,
}

#[snafu::report]
pub fn main() -> Result<(), snafu::Whatever> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("CSR_OPERATOR_LOG")
        .from_env()
        .whatever_context("failed to create tracing subscriber EnvFilter")?;
    tracing_subscriber::fmt()
        // Short running tool does not need any complex output
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match Cli::parse().command {
        Command::Inspect(args) => inspect(args),
        Command::Sign(args) => sign(args),
        Command::Export(args) => {
            let json = export(&read(&args.csr)?, args.exact)?;
            println!("{json}");
            Ok(())
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>, snafu::Whatever> {
    fs::read(path).with_whatever_context(|_| format!("failed to read {path:?}"))
}

fn inspect(args: InspectArgs) -> Result<(), snafu::Whatever> {
    let parsed = request::parse_and_verify(&read(&args.request)?)
        .whatever_context("request is invalid")?;
    let inspection = Inspection {
        fingerprint: request::fingerprint(&parsed)
            .whatever_context("failed to fingerprint request")?,
        fields: request::canonicalize(&parsed),
    };
    let json = serde_json::to_string_pretty(&inspection)
        .whatever_context("failed to serialize request fields")?;
    println!("{json}");
    Ok(())
}

fn sign(args: SignArgs) -> Result<(), snafu::Whatever> {
    let ca = CertificateAuthority::from_files(&args.ca_cert, &args.ca_key)
        .whatever_context("failed to load CA")?
        .with_cert_lifetime(time::Duration::days(args.lifetime_days.into()));
    let certificate = ca
        .sign_request(&read(&args.request)?)
        .whatever_context("failed to sign request")?;
    match &args.out {
        Some(out) => {
            fs::write(out, &certificate)
                .with_whatever_context(|_| format!("failed to write certificate to {out:?}"))?;
            info!(?out, "Wrote certificate");
        }
        None => print!("{}", String::from_utf8_lossy(&certificate)),
    }
    Ok(())
}

fn export(csr: &[u8], exact: bool) -> Result<String, snafu::Whatever> {
    let mut csr = serde_json::from_slice::<CertificateSigningRequest>(csr)
        .whatever_context("failed to parse CertificateSigningRequest")?;
    CsrStrategy.export(&mut csr, exact);
    serde_json::to_string_pretty(&csr).whatever_context("failed to serialize CertificateSigningRequest")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issued_csr() -> Vec<u8> {
        let mut csr = CertificateSigningRequest::new("node1", b"request".to_vec());
        csr.metadata.resource_version = "3".to_string();
        csr.spec.username = Some("system:node:node1".to_string());
        csr.spec.groups = vec!["system:nodes".to_string()];
        csr.spec.fingerprint = Some("00ff".to_string());
        csr.spec.hostnames = vec!["node1.example.com".to_string()];
        csr.status.certificate = Some(b"certificate".to_vec());
        serde_json::to_vec(&csr).unwrap()
    }

    #[test]
    fn export_keeps_identity_only_when_exact() {
        let exact: CertificateSigningRequest =
            serde_json::from_str(&export(&issued_csr(), true).unwrap()).unwrap();
        assert_eq!(exact.metadata.name, "node1");
        assert_eq!(exact.spec.request, b"request");
        assert_eq!(exact.spec.username.as_deref(), Some("system:node:node1"));
        assert_eq!(exact.spec.groups, ["system:nodes"]);
        assert_eq!(exact.spec.fingerprint, None);
        assert!(exact.spec.hostnames.is_empty());
        assert_eq!(exact.status.certificate, None);

        let inexact: CertificateSigningRequest =
            serde_json::from_str(&export(&issued_csr(), false).unwrap()).unwrap();
        assert_eq!(inexact.spec.username, None);
        assert!(inexact.spec.groups.is_empty());
        assert_eq!(inexact.spec.request, b"request");
    }

    #[test]
    fn export_rejects_garbage() {
        export(b"not json", false).unwrap_err();
    }

    #[test]
    fn export_is_parsed_from_the_command_line() {
        let cli = Cli::try_parse_from(["csr-operator", "export", "--csr", "csr.json", "--exact"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Command::Export(ExportArgs { exact: true, .. })
        ));
    }
}
