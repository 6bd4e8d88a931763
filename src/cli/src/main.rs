use ostrust::ca::{self, CertificateArgs};
use ostrust::keys::KeyAlgorithm;
use ostrust::package::{self, CreateArgs};
use ostrust::sigsum;
use ostrust::trustpolicy;
use ostrust::verify::{self, VerifyArgs};
use ostrust::TrustError;

use clap::{crate_description, crate_version, Arg, ArgAction, Command};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

fn parse_date(value: Option<&str>, flag: &str) -> Result<Option<OffsetDateTime>, TrustError> {
    match value {
        None => Ok(None),
        Some(text) => OffsetDateTime::parse(text, &Rfc3339)
            .map(Some)
            .map_err(|e| TrustError::ParseError(format!("{}: {}", flag, e))),
    }
}

fn parse_algorithm(value: Option<&str>) -> Result<Option<KeyAlgorithm>, TrustError> {
    match value {
        None => Ok(None),
        Some("ed25519") => Ok(Some(KeyAlgorithm::Ed25519)),
        Some("ecdsa-p256") => Ok(Some(KeyAlgorithm::EcdsaP256)),
        Some(other) => Err(TrustError::ParseError(format!(
            "unknown algorithm {:?}",
            other
        ))),
    }
}

fn start() -> Result<(), TrustError> {
    let matches = Command::new("ostrust")
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Verbose output"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("Prints debugging information"),
        )
        .subcommand(
            Command::new("keygen")
                .about("Key and certificate generation")
                .subcommand(
                    Command::new("certificate")
                        .about("Create a signing certificate, and a key pair if none is supplied")
                        .arg(
                            Arg::new("is_ca")
                                .long("is-ca")
                                .action(ArgAction::SetTrue)
                                .help("Create a self-signed CA certificate"),
                        )
                        .arg(
                            Arg::new("root_cert")
                                .value_name("pem_file")
                                .long("root-cert")
                                .help("Root certificate used to sign the new certificate"),
                        )
                        .arg(
                            Arg::new("root_key")
                                .value_name("pem_file")
                                .long("root-key")
                                .help("Private key of the issuer"),
                        )
                        .arg(
                            Arg::new("subject_key")
                                .value_name("key_file")
                                .long("subject-key")
                                .help("Public key to certify (PEM or OpenSSH)"),
                        )
                        .arg(
                            Arg::new("algorithm")
                                .value_name("algorithm")
                                .long("algorithm")
                                .value_parser(["ed25519", "ecdsa-p256"])
                                .help("Algorithm for freshly generated keys"),
                        )
                        .arg(
                            Arg::new("valid_from")
                                .value_name("timestamp")
                                .long("valid-from")
                                .help("Validity start as RFC 3339, defaults to now"),
                        )
                        .arg(
                            Arg::new("valid_until")
                                .value_name("timestamp")
                                .long("valid-until")
                                .help("Validity end as RFC 3339, defaults to 72 hours after start"),
                        )
                        .arg(
                            Arg::new("cert_out")
                                .value_name("pem_file")
                                .long("cert-out")
                                .help("Certificate output file"),
                        )
                        .arg(
                            Arg::new("key_out")
                                .value_name("pem_file")
                                .long("key-out")
                                .help("Private key output file"),
                        ),
                ),
        )
        .subcommand(
            Command::new("ospkg")
                .about("OS package operations")
                .subcommand(
                    Command::new("create")
                        .about("Pack a kernel and initramfs into a new OS package")
                        .arg(
                            Arg::new("out")
                                .value_name("path")
                                .long("out")
                                .short('o')
                                .help("Output path or directory"),
                        )
                        .arg(
                            Arg::new("label")
                                .value_name("text")
                                .long("label")
                                .help("Human-readable package label"),
                        )
                        .arg(
                            Arg::new("url")
                                .value_name("url")
                                .long("url")
                                .help("URL the package will be served from"),
                        )
                        .arg(
                            Arg::new("kernel")
                                .value_name("file")
                                .long("kernel")
                                .short('k')
                                .required(true)
                                .help("Kernel image"),
                        )
                        .arg(
                            Arg::new("initramfs")
                                .value_name("file")
                                .long("initramfs")
                                .short('i')
                                .help("Initramfs image"),
                        )
                        .arg(
                            Arg::new("cmdline")
                                .value_name("text")
                                .long("cmdline")
                                .short('c')
                                .help("Kernel command line"),
                        ),
                )
                .subcommand(
                    Command::new("sign")
                        .about("Sign an OS package")
                        .arg(
                            Arg::new("key")
                                .value_name("pem_file")
                                .long("key")
                                .short('k')
                                .required(true)
                                .help("Private signing key"),
                        )
                        .arg(
                            Arg::new("cert")
                                .value_name("pem_file")
                                .long("cert")
                                .short('c')
                                .required(true)
                                .help("Certificate matching the signing key"),
                        )
                        .arg(
                            Arg::new("ospkg")
                                .value_name("path")
                                .long("ospkg")
                                .short('p')
                                .required(true)
                                .help("OS package path"),
                        ),
                )
                .subcommand(
                    Command::new("sigsum")
                        .about("Attach a Sigsum log proof to an OS package")
                        .arg(
                            Arg::new("proof")
                                .value_name("file")
                                .long("proof")
                                .required(true)
                                .help("Sigsum proof file"),
                        )
                        .arg(
                            Arg::new("cert")
                                .value_name("pem_file")
                                .long("cert")
                                .short('c')
                                .required(true)
                                .help("Certificate of the log submitter key"),
                        )
                        .arg(
                            Arg::new("ospkg")
                                .value_name("path")
                                .long("ospkg")
                                .short('p')
                                .required(true)
                                .help("OS package path"),
                        ),
                )
                .subcommand(
                    Command::new("verify")
                        .about("Verify the signatures of an OS package")
                        .arg(
                            Arg::new("trust_policy")
                                .value_name("dir")
                                .long("trust-policy")
                                .conflicts_with("root_certs")
                                .help("Trust directory with policy and signing root"),
                        )
                        .arg(
                            Arg::new("root_certs")
                                .value_name("pem_file")
                                .long("root-certs")
                                .help("Root certificate bundle, bypassing the policy file"),
                        )
                        .arg(
                            Arg::new("threshold")
                                .value_name("count")
                                .long("threshold")
                                .requires("root_certs")
                                .help("Required number of valid signatures (0: all found)"),
                        )
                        .arg(
                            Arg::new("ospkg")
                                .value_name("path")
                                .long("ospkg")
                                .short('p')
                                .required(true)
                                .help("OS package path"),
                        ),
                ),
        )
        .subcommand(
            Command::new("trustpolicy")
                .about("Trust policy operations")
                .subcommand(
                    Command::new("check")
                        .about("Validate a trust policy file")
                        .arg(
                            Arg::new("policy")
                                .value_name("json_file")
                                .required(true)
                                .help("Policy file to validate"),
                        )
                        .arg(
                            Arg::new("out")
                                .value_name("json_file")
                                .long("out")
                                .short('o')
                                .help("Rewrite the policy in canonical form to this file"),
                        ),
                ),
        )
        .get_matches();

    let debug = matches.get_flag("debug");
    let verbose = matches.get_flag("verbose");

    env_logger::builder()
        .format_timestamp(None)
        .format_level(false)
        .format_module_path(false)
        .format_target(false)
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else if verbose {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Warn
        })
        .init();

    if let Some(matches) = matches.subcommand_matches("keygen") {
        let matches = matches
            .subcommand_matches("certificate")
            .ok_or_else(|| TrustError::ParseError("missing keygen subcommand".to_string()))?;

        let args = CertificateArgs {
            is_ca: matches.get_flag("is_ca"),
            issuer_cert: matches.get_one::<String>("root_cert").map(PathBuf::from),
            issuer_key: matches.get_one::<String>("root_key").map(PathBuf::from),
            subject_key: matches.get_one::<String>("subject_key").map(PathBuf::from),
            algorithm: parse_algorithm(
                matches.get_one::<String>("algorithm").map(|s| s.as_str()),
            )?,
            not_before: parse_date(
                matches.get_one::<String>("valid_from").map(|s| s.as_str()),
                "--valid-from",
            )?,
            not_after: parse_date(
                matches.get_one::<String>("valid_until").map(|s| s.as_str()),
                "--valid-until",
            )?,
            cert_out: matches.get_one::<String>("cert_out").map(PathBuf::from),
            key_out: matches.get_one::<String>("key_out").map(PathBuf::from),
        };
        ca::certificate(&args)?;
    } else if let Some(matches) = matches.subcommand_matches("ospkg") {
        if let Some(matches) = matches.subcommand_matches("create") {
            let kernel = matches
                .get_one::<String>("kernel")
                .map(PathBuf::from)
                .ok_or_else(|| TrustError::ParseError("missing kernel".to_string()))?;
            let args = CreateArgs {
                out: matches.get_one::<String>("out").cloned().unwrap_or_default(),
                label: matches
                    .get_one::<String>("label")
                    .cloned()
                    .unwrap_or_default(),
                url: matches.get_one::<String>("url").cloned().unwrap_or_default(),
                kernel,
                initramfs: matches.get_one::<String>("initramfs").map(PathBuf::from),
                cmdline: matches
                    .get_one::<String>("cmdline")
                    .cloned()
                    .unwrap_or_default(),
            };
            package::create(&args)?;
        } else if let Some(matches) = matches.subcommand_matches("sign") {
            let key = matches.get_one::<String>("key").map(|s| s.as_str());
            let cert = matches.get_one::<String>("cert").map(|s| s.as_str());
            let pkg = matches.get_one::<String>("ospkg").map(|s| s.as_str());
            let key = key.ok_or_else(|| TrustError::ParseError("missing key".to_string()))?;
            let cert = cert.ok_or_else(|| TrustError::ParseError("missing cert".to_string()))?;
            let pkg = pkg.ok_or_else(|| TrustError::ParseError("missing ospkg".to_string()))?;
            package::sign_package(key, cert, pkg)?;
        } else if let Some(matches) = matches.subcommand_matches("sigsum") {
            let proof = matches.get_one::<String>("proof").map(|s| s.as_str());
            let cert = matches.get_one::<String>("cert").map(|s| s.as_str());
            let pkg = matches.get_one::<String>("ospkg").map(|s| s.as_str());
            let proof = proof.ok_or_else(|| TrustError::ParseError("missing proof".to_string()))?;
            let cert = cert.ok_or_else(|| TrustError::ParseError("missing cert".to_string()))?;
            let pkg = pkg.ok_or_else(|| TrustError::ParseError("missing ospkg".to_string()))?;
            sigsum::attach_proof(proof, cert, pkg)?;
        } else if let Some(matches) = matches.subcommand_matches("verify") {
            let threshold = match matches.get_one::<String>("threshold") {
                None => None,
                Some(text) => Some(text.parse::<usize>().map_err(|_| {
                    TrustError::ParseError(format!("bad threshold {:?}", text))
                })?),
            };
            let args = VerifyArgs {
                pkg: matches
                    .get_one::<String>("ospkg")
                    .cloned()
                    .ok_or_else(|| TrustError::ParseError("missing ospkg".to_string()))?,
                policy_dir: matches
                    .get_one::<String>("trust_policy")
                    .map(PathBuf::from),
                root_certs: matches.get_one::<String>("root_certs").map(PathBuf::from),
                threshold,
            };
            let report = verify::verify(&args)?;
            println!(
                "Signatures valid: {} of {} found, {} required",
                report.valid, report.found, report.required
            );
        } else {
            return Err(TrustError::ParseError(
                "missing ospkg subcommand, use: create, sign, sigsum, or verify".to_string(),
            ));
        }
    } else if let Some(matches) = matches.subcommand_matches("trustpolicy") {
        let matches = matches
            .subcommand_matches("check")
            .ok_or_else(|| TrustError::ParseError("missing trustpolicy subcommand".to_string()))?;
        let policy = matches
            .get_one::<String>("policy")
            .ok_or_else(|| TrustError::ParseError("missing policy file".to_string()))?;
        let out = matches.get_one::<String>("out").map(Path::new);
        let policy = trustpolicy::check(policy, out)?;
        println!(
            "Policy OK: threshold {}, fetch method {:?}",
            policy.ospkg_signature_threshold, policy.ospkg_fetch_method
        );
    } else {
        return Err(TrustError::ParseError(
            "no subcommand specified".to_string(),
        ));
    }
    Ok(())
}

fn main() {
    if let Err(e) = start() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
