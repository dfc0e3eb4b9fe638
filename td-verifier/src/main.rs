use anyhow::{anyhow, Context};
use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use clap::{Parser, Subcommand};
use env_logger::Env;
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::io::Write;
use std::{fs, path::Path, path::PathBuf, time::Duration, time::SystemTime};
use td_verifier::attestation::{Byte48, Tpm2Baseline};
use td_verifier::challenge::totp;
use td_verifier::provider::{self, AkBlob, ConfigfsTsmProvider, PlatformAttester, QuoteProvider};
use td_verifier::tpm::{TssPlatformAttester, DEFAULT_TCTI};
use td_verifier::AttestationKind;

type CliResult<T> = Result<T, anyhow::Error>;

const TOKEN_FILE_NAME: &str = ".td-login-token";

const NOT_PERSISTED: &str = "Authentication was successful, but the token was not persisted. \
The resulting credential is shown below for your records.";

/// Authenticates this trusted domain against an attestation auth server.
#[derive(Parser, Debug)]
#[command(name = "td-login", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in with a TOTP code and a fresh attestation; stores and prints the credential.
    Login(LoginArgs),
    /// Print the measurements of this machine as baseline values for registration.
    Quote(QuoteArgs),
}

#[derive(clap::Args, Debug)]
struct LoginArgs {
    /// Name the trusted domain is registered under.
    #[arg(env = "TD_LOGIN_NAME")]
    name: String,

    /// Auth server base URL.
    #[arg(long, env = "TD_LOGIN_ADDRESS", default_value = "https://127.0.0.1:8200")]
    address: String,

    /// Path prefix the API is mounted under.
    #[arg(long, env = "TD_LOGIN_MOUNT", default_value = "v1")]
    mount: String,

    /// Attestation type: `tdx` or `tpm2`.
    #[arg(long, env = "TD_LOGIN_ATTESTATION_TYPE", default_value = "tdx")]
    attestation_type: AttestationKind,

    /// Base32 TOTP secret, or a path to a file holding it.
    #[arg(long, env = "TD_LOGIN_TOTP_SECRET", hide_env_values = true)]
    totp_secret: String,

    /// TPM 2.0 attestation key blob as written by `quote --attestation-type tpm2`,
    /// or a path to a file holding it.
    #[arg(
        long,
        env = "TD_LOGIN_TPM2_AK_BLOB",
        hide_env_values = true,
        required_if_eq("attestation_type", "tpm2")
    )]
    ak_blob: Option<String>,

    /// TCTI of the TPM 2.0 device.
    #[arg(long, env = "TD_LOGIN_TCTI", default_value = DEFAULT_TCTI)]
    tcti: String,

    /// PEM bundle of additional trusted CA certificates.
    #[arg(long, env = "TD_LOGIN_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Do not verify the server certificate.
    #[arg(long, env = "TD_LOGIN_TLS_SKIP_VERIFY")]
    tls_skip_verify: bool,

    /// Timeout of each request, in seconds.
    #[arg(long, env = "TD_LOGIN_TIMEOUT", default_value_t = 5)]
    timeout: u64,

    /// File the client token is stored in [default: ~/.td-login-token].
    #[arg(long, env = "TD_LOGIN_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    /// Do not print the credential; the token is still stored.
    #[arg(long)]
    no_print: bool,

    /// Do not store the token; the credential is only printed.
    #[arg(long, conflicts_with = "no_print")]
    no_store: bool,
}

#[derive(clap::Args, Debug)]
struct QuoteArgs {
    /// Attestation type: `tdx` or `tpm2`.
    #[arg(long, env = "TD_LOGIN_ATTESTATION_TYPE", default_value = "tdx")]
    attestation_type: AttestationKind,

    /// Where to write the new attestation key blob (tpm2 only).
    #[arg(long, required_if_eq("attestation_type", "tpm2"))]
    ak_blob_out: Option<PathBuf>,

    /// TCTI of the TPM 2.0 device.
    #[arg(long, env = "TD_LOGIN_TCTI", default_value = DEFAULT_TCTI)]
    tcti: String,

    /// Print the baseline as JSON record fields instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Deserialize)]
struct NonceResponse {
    nonce: String,
    /// Registered attestation key, echoed for tpm2.
    #[serde(default)]
    ak_public: Option<String>,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .try_init()
        .ok();

    match Cli::parse().command {
        Command::Login(args) => login(args).await,
        Command::Quote(args) => quote(args),
    }
}

/// Two-code login: the first TOTP code buys a nonce, the second one (from the
/// next period, since codes are single use) goes with the attestation.
async fn login(args: LoginArgs) -> CliResult<()> {
    let secret = resolve_totp_secret(&args.totp_secret)?;
    let ak = match args.attestation_type {
        AttestationKind::Tdx => None,
        AttestationKind::Tpm2 => {
            let blob = args
                .ak_blob
                .as_deref()
                .ok_or_else(|| anyhow!("--ak-blob is required for tpm2"))?;
            Some(resolve_ak_blob(blob)?)
        }
    };
    let token_file = if args.no_store {
        None
    } else {
        Some(token_file(args.token_file.as_deref())?)
    };
    let client = http_client(&args)?;
    let base = format!(
        "{}/{}/{}/{}",
        args.address.trim_end_matches('/'),
        args.mount.trim_matches('/'),
        args.attestation_type,
        args.name
    );

    let issued_at = SystemTime::now();
    let code = totp::generate_code(&secret, issued_at)?;
    tracing::debug!("requesting attestation nonce from {base}/nonce");
    let nonce: NonceResponse = client
        .post(format!("{base}/nonce"))
        .json(&serde_json::json!({ "totp": code }))
        .send()
        .await?
        .error_for_status()
        .context("nonce request was rejected")?
        .json()
        .await?;

    let mut body = match &ak {
        None => {
            let report_data = provider::report_data_from_nonce(&nonce.nonce)?;
            let raw_quote = ConfigfsTsmProvider.tdx_quote(report_data)?;
            serde_json::json!({ "quote": b64.encode(&raw_quote) })
        }
        Some(ak) => {
            let raw_nonce = provider::tpm2_nonce(&nonce.nonce)?;
            ak.check_echo(nonce.ak_public.as_deref())?;
            let attestation = TssPlatformAttester::new(&args.tcti).attest_platform(ak, &raw_nonce)?;
            serde_json::json!({
                "attestation": b64.encode(serde_json::to_vec(&attestation)?),
                "nonce": nonce.nonce,
            })
        }
    };

    let wait = totp::until_next_period(issued_at)
        .saturating_sub(SystemTime::now().duration_since(issued_at).unwrap_or_default());
    tokio::time::sleep(wait).await;
    body["totp"] = totp::generate_code(&secret, SystemTime::now())?.into();

    tracing::debug!("logging in at {base}/login");
    let credential: JsonValue = client
        .post(format!("{base}/login"))
        .json(&body)
        .send()
        .await?
        .error_for_status()
        .context("login was rejected")?
        .json()
        .await?;

    tracing::info!("logged in as {}/{}", args.attestation_type, args.name);
    deliver(&credential, token_file.as_deref(), !args.no_print, &mut std::io::stdout())
}

/// Stores the client token and prints the credential, as the flags say. A
/// credential that could not be stored is printed regardless.
fn deliver(
    credential: &JsonValue,
    store: Option<&Path>,
    print: bool,
    out: &mut dyn Write,
) -> CliResult<()> {
    let token = credential
        .pointer("/auth/client_token")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| anyhow!("login response carries no client token"))?;
    let pretty = serde_json::to_string_pretty(credential)?;

    if let Some(path) = store {
        if let Err(e) = write_private(path, token.as_bytes()) {
            writeln!(out, "{NOT_PERSISTED}\n")?;
            writeln!(out, "{pretty}")?;
            return Err(e.context("failed to store token"));
        }
        tracing::info!("stored token in {}", path.display());
    }
    if print {
        writeln!(out, "{pretty}")?;
    }
    Ok(())
}

fn quote(args: QuoteArgs) -> CliResult<()> {
    match args.attestation_type {
        AttestationKind::Tdx => quote_tdx(args.json),
        AttestationKind::Tpm2 => {
            let out = args
                .ak_blob_out
                .as_deref()
                .ok_or_else(|| anyhow!("--ak-blob-out is required for tpm2"))?;
            quote_tpm2(&TssPlatformAttester::new(&args.tcti), out, args.json)
        }
    }
}

fn quote_tdx(json: bool) -> CliResult<()> {
    let baseline = provider::local_tdx_baseline(&ConfigfsTsmProvider)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&baseline)?);
        return Ok(());
    }

    let show = |v: &Option<Byte48>| {
        v.as_ref().map(ToString::to_string).unwrap_or_default()
    };
    println!();
    println!("Field                 Value");
    println!("--------------------  ----------------------------------------------------------------");
    println!("MROWNER:              {}", show(&baseline.mr_owner));
    println!("MROWNERCONFIG:        {}", show(&baseline.mr_owner_config));
    println!("MRCONFIGID:           {}", show(&baseline.mr_config_id));
    println!("MRTD:                 {}", show(&baseline.mr_td));
    println!("RTMR[0]:              {}", show(&baseline.rtmr0));
    println!("RTMR[1]:              {}", show(&baseline.rtmr1));
    println!("RTMR[2]:              {}", show(&baseline.rtmr2));
    println!("RTMR[3]:              {}", show(&baseline.rtmr3));
    println!("TUD.DEBUG:            {}", !baseline.check_debug);
    println!("SEC.SEPT_VE_DISABLE:  {}", baseline.check_sept_ve_disable);
    println!();
    Ok(())
}

/// Creates an attestation key, keeps its blob in `blob_out` and prints the
/// registration fields that pin it and the current PCR values.
fn quote_tpm2(attester: &dyn PlatformAttester, blob_out: &Path, json: bool) -> CliResult<()> {
    let (baseline, ak) = provider::local_tpm2_baseline(attester)?;
    write_private(blob_out, ak.encode()?.as_bytes())?;
    tracing::info!("wrote tpm2 attestation key blob to {}", blob_out.display());

    let fields = tpm2_fields(&baseline);
    if json {
        println!("{}", serde_json::to_string_pretty(&fields)?);
        return Ok(());
    }
    println!();
    println!("Field                 Value");
    println!("--------------------  ----------------------------------------------------------------");
    for (name, value) in &fields {
        println!("{:<22}{}", format!("{name}:"), value.as_str().unwrap_or_default());
    }
    println!();
    Ok(())
}

/// `tpm2_ak_public` and the set `tpm2_pcrNN` fields, named as the server's
/// registration endpoint expects them.
fn tpm2_fields(baseline: &Tpm2Baseline) -> JsonMap<String, JsonValue> {
    let mut fields = JsonMap::new();
    fields.insert("tpm2_ak_public".into(), baseline.ak_public.to_string().into());
    for (idx, pcr) in baseline.pcrs.iter().enumerate() {
        if let Some(pcr) = pcr {
            fields.insert(format!("tpm2_pcr{idx:02}"), pcr.to_string().into());
        }
    }
    fields
}

/// Accepts the secret itself or the path of a file that holds it.
fn resolve_totp_secret(value: &str) -> CliResult<String> {
    if totp::decode_secret(value).is_ok() {
        return Ok(value.trim().to_string());
    }
    let path = Path::new(value);
    if path.is_file() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
        totp::decode_secret(&contents).map_err(|e| anyhow!("invalid totp secret: {e}"))?;
        return Ok(contents.trim().to_string());
    }
    Err(anyhow!("invalid totp secret: neither base32 nor a readable file"))
}

/// Accepts the blob itself or the path of a file that holds it.
fn resolve_ak_blob(value: &str) -> CliResult<AkBlob> {
    if let Ok(blob) = AkBlob::decode(value) {
        return Ok(blob);
    }
    let path = Path::new(value);
    if path.is_file() {
        let contents = fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
        return Ok(AkBlob::decode(&contents)?);
    }
    Err(anyhow!("invalid tpm2 attestation key blob: neither a blob nor a readable file"))
}

fn token_file(explicit: Option<&Path>) -> CliResult<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(TOKEN_FILE_NAME))
            .ok_or_else(|| anyhow!("HOME is not set; pass --token-file or --no-store")),
    }
}

/// Writes `contents` readable by the owner only, replacing `path` atomically.
fn write_private(path: &Path, contents: &[u8]) -> CliResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(&tmp).with_context(|| format!("open {:?}", tmp))?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("rename {:?} to {:?}", tmp, path))?;
    Ok(())
}

fn http_client(args: &LoginArgs) -> CliResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .danger_accept_invalid_certs(args.tls_skip_verify);
    if let Some(path) = &args.ca_cert {
        let pem = fs::read(path).with_context(|| format!("read {:?}", path))?;
        for cert in reqwest::Certificate::from_pem_bundle(&pem)? {
            builder = builder.add_root_certificate(cert);
        }
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_login_flags_and_defaults() {
        let cli = Cli::try_parse_from([
            "td-login",
            "login",
            "alice",
            "--totp-secret",
            "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ",
        ])
        .unwrap();
        let Command::Login(args) = cli.command else {
            panic!("expected login");
        };
        assert_eq!(args.name, "alice");
        assert_eq!(args.attestation_type, AttestationKind::Tdx);
        assert_eq!(args.mount, "v1");
        assert_eq!(args.timeout, 5);
        assert!(!args.tls_skip_verify);
    }

    #[test]
    fn rejects_unknown_attestation_type() {
        let res = Cli::try_parse_from(["td-login", "quote", "--attestation-type", "sev"]);
        assert!(res.is_err());
    }

    #[test]
    fn totp_secret_from_value_or_file() {
        let secret = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";
        assert_eq!(resolve_totp_secret(secret).unwrap(), secret);

        let path = std::env::temp_dir().join(format!("td-login-secret-{}", std::process::id()));
        fs::write(&path, format!("{secret}\n")).unwrap();
        assert_eq!(resolve_totp_secret(path.to_str().unwrap()).unwrap(), secret);
        fs::remove_file(&path).unwrap();

        assert!(resolve_totp_secret("/nonexistent/secret!").is_err());
    }

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("td-login-{name}-{}", std::process::id()))
    }

    fn credential() -> JsonValue {
        serde_json::json!({ "auth": { "client_token": "tda.abc", "alias": "tpm2/alice" } })
    }

    #[test]
    fn tpm2_login_needs_a_key_blob() {
        let base = ["td-login", "login", "alice", "--totp-secret", "GEZDGNBVGY3TQOJQ"];
        let res = Cli::try_parse_from(base.iter().copied().chain(["--attestation-type", "tpm2"]));
        assert!(res.is_err());

        let cli = Cli::try_parse_from(
            base.iter()
                .copied()
                .chain(["--attestation-type", "tpm2", "--ak-blob", "blob.b64"]),
        )
        .unwrap();
        let Command::Login(args) = cli.command else {
            panic!("expected login");
        };
        assert_eq!(args.attestation_type, AttestationKind::Tpm2);
        assert_eq!(args.tcti, DEFAULT_TCTI);
    }

    #[test]
    fn no_print_and_no_store_cannot_be_combined() {
        let res = Cli::try_parse_from([
            "td-login",
            "login",
            "alice",
            "--totp-secret",
            "GEZDGNBVGY3TQOJQ",
            "--no-print",
            "--no-store",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn tpm2_quote_needs_somewhere_to_keep_the_key() {
        assert!(Cli::try_parse_from(["td-login", "quote", "--attestation-type", "tpm2"]).is_err());
        assert!(Cli::try_parse_from([
            "td-login",
            "quote",
            "--attestation-type",
            "tpm2",
            "--ak-blob-out",
            "/tmp/ak"
        ])
        .is_ok());
    }

    #[test]
    fn stores_token_and_prints_credential() {
        let path = scratch("token");
        let mut out = Vec::new();
        deliver(&credential(), Some(&path), true, &mut out).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "tda.abc");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let printed: JsonValue = serde_json::from_slice(&out).unwrap();
        assert_eq!(printed, credential());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn no_print_stores_silently_and_no_store_leaves_no_file() {
        let path = scratch("silent");
        let mut out = Vec::new();
        deliver(&credential(), Some(&path), false, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "tda.abc");
        fs::remove_file(&path).unwrap();

        let mut out = Vec::new();
        deliver(&credential(), None, true, &mut out).unwrap();
        assert!(!out.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn unstorable_token_is_still_shown() {
        let path = Path::new("/nonexistent/dir/token");
        let mut out = Vec::new();
        let err = deliver(&credential(), Some(path), false, &mut out).unwrap_err();
        assert!(err.to_string().starts_with("failed to store token"));

        let shown = String::from_utf8(out).unwrap();
        assert!(shown.starts_with(NOT_PERSISTED));
        assert!(shown.contains("tda.abc"));
    }

    #[test]
    fn response_without_token_is_an_error() {
        let mut out = Vec::new();
        let res = deliver(&serde_json::json!({ "auth": {} }), None, true, &mut out);
        assert_eq!(res.unwrap_err().to_string(), "login response carries no client token");
    }

    #[test]
    fn ak_blob_from_value_or_file() {
        let blob = AkBlob {
            public: vec![1, 2, 3].into(),
            private: vec![4, 5, 6].into(),
        };
        let encoded = blob.encode().unwrap();
        assert_eq!(resolve_ak_blob(&encoded).unwrap(), blob);

        let path = scratch("ak");
        write_private(&path, encoded.as_bytes()).unwrap();
        assert_eq!(resolve_ak_blob(path.to_str().unwrap()).unwrap(), blob);
        fs::remove_file(&path).unwrap();

        assert!(resolve_ak_blob("/nonexistent/ak").is_err());
    }

    #[test]
    fn tpm2_fields_match_registration_names() {
        let mut baseline = Tpm2Baseline {
            ak_public: vec![1, 2, 3].into(),
            ..Default::default()
        };
        baseline.pcrs[7] = Some(td_verifier::attestation::Byte32::default());
        let fields = tpm2_fields(&baseline);

        assert_eq!(fields["tpm2_ak_public"], "AQID");
        assert_eq!(fields["tpm2_pcr07"], b64.encode([0u8; 32]));
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn explicit_token_file_wins() {
        let path = Path::new("/run/td/token");
        assert_eq!(token_file(Some(path)).unwrap(), path);
    }
}
