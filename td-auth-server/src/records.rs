//! Identity records of registered trusted domains.
//!
//! A record is stored as JSON under `"{kind}/{name}"`. Upserts are partial:
//! only the fields present in the request body are touched, every field is
//! parsed independently and all problems are reported together.

use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use td_verifier::attestation::types::FixedBytes;
use td_verifier::attestation::{AttnError, Bytes, MultiError, TdxBaseline, Tpm2Baseline};
use td_verifier::AttestationKind;

use crate::errors::AuthError;

/// Request body of an upsert.
pub type Fields = Map<String, Value>;

/// Names look like `\w(([\w-.@]+)?\w)?`.
pub fn validate_name(name: &str) -> Result<(), AuthError> {
    let word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let inner = |c: char| word(c) || matches!(c, '-' | '.' | '@');
    let ok = match (name.chars().next(), name.chars().last()) {
        (Some(first), Some(last)) => word(first) && word(last) && name.chars().all(inner),
        _ => false,
    };
    if ok {
        Ok(())
    } else if name.is_empty() {
        Err(AuthError::InvalidRequest("`name` field is required".into()))
    } else {
        Err(AuthError::InvalidRequest(format!("invalid domain name: {name}")))
    }
}

/// Parameters of the credential issued on login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenParams {
    /// Lease duration in seconds; 0 means the server default.
    #[serde(default)]
    pub token_ttl: u64,
    /// Upper bound on the lease in seconds; 0 means unbounded.
    #[serde(default)]
    pub token_max_ttl: u64,
    #[serde(default)]
    pub token_policies: Vec<String>,
}

impl TokenParams {
    fn apply(&mut self, fields: &Fields, errs: &mut MultiError) {
        if let Some(v) = fields.get("token_ttl") {
            match parse_seconds("token_ttl", v) {
                Ok(secs) => self.token_ttl = secs,
                Err(e) => errs.push(e),
            }
        }
        if let Some(v) = fields.get("token_max_ttl") {
            match parse_seconds("token_max_ttl", v) {
                Ok(secs) => self.token_max_ttl = secs,
                Err(e) => errs.push(e),
            }
        }
        if let Some(v) = fields.get("token_policies") {
            match parse_policies(v) {
                Ok(p) => self.token_policies = p,
                Err(e) => errs.push(e),
            }
        }
        if self.token_max_ttl > 0 && self.token_ttl > self.token_max_ttl {
            errs.push(AttnError::Decode(
                "token_ttl must not exceed token_max_ttl".into(),
            ));
        }
    }

    fn describe(&self, out: &mut Fields) {
        out.insert("token_ttl".into(), self.token_ttl.into());
        out.insert("token_max_ttl".into(), self.token_max_ttl.into());
        out.insert("token_policies".into(), self.token_policies.clone().into());
    }
}

/// Seconds as a number or as a string with an optional `s`, `m` or `h` unit.
fn parse_seconds(key: &str, v: &Value) -> Result<u64, AttnError> {
    let bad = || AttnError::Decode(format!("{key} is not a valid duration"));
    match v {
        Value::Number(n) => n.as_u64().ok_or_else(bad),
        Value::String(s) => {
            let s = s.trim();
            let (digits, mult) = match s.char_indices().last() {
                Some((i, 's')) => (&s[..i], 1),
                Some((i, 'm')) => (&s[..i], 60),
                Some((i, 'h')) => (&s[..i], 3600),
                _ => (s, 1),
            };
            digits
                .parse::<u64>()
                .ok()
                .and_then(|n| n.checked_mul(mult))
                .ok_or_else(bad)
        }
        _ => Err(bad()),
    }
}

fn parse_policies(v: &Value) -> Result<Vec<String>, AttnError> {
    let bad = || AttnError::Decode("token_policies must be a list of strings".into());
    let raw: Vec<String> = match v {
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        Value::Array(items) => items
            .iter()
            .map(|i| i.as_str().map(str::to_string).ok_or_else(bad))
            .collect::<Result<_, _>>()?,
        Value::Null => Vec::new(),
        _ => return Err(bad()),
    };
    let mut out: Vec<String> = raw
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    out.sort();
    out.dedup();
    Ok(out)
}

/// `Some(None)` when the field is present but empty, which clears it.
fn fixed_field<const N: usize>(
    fields: &Fields,
    key: &str,
    errs: &mut MultiError,
) -> Option<Option<FixedBytes<N>>> {
    match fields.get(key)? {
        Value::Null => Some(None),
        Value::String(s) if s.is_empty() => Some(None),
        Value::String(s) => match FixedBytes::<N>::from_b64_padded(key, s) {
            Ok(v) => Some(Some(v)),
            Err(e) => {
                errs.push(e);
                None
            }
        },
        _ => {
            errs.push(AttnError::Decode(format!("{key} is not encoded as base64 string")));
            None
        }
    }
}

fn bool_field(fields: &Fields, key: &str, errs: &mut MultiError) -> Option<bool> {
    match fields.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => {
                errs.push(AttnError::Decode(format!("{key} must be a boolean")));
                None
            }
        },
        _ => {
            errs.push(AttnError::Decode(format!("{key} must be a boolean")));
            None
        }
    }
}

fn string_field<'a>(fields: &'a Fields, key: &str, errs: &mut MultiError) -> Option<&'a str> {
    match fields.get(key)? {
        Value::String(s) => Some(s.as_str()),
        Value::Null => Some(""),
        _ => {
            errs.push(AttnError::Decode(format!("{key} must be a string")));
            None
        }
    }
}

/// Shared shape of TDX and TPM 2.0 identity records.
pub trait TrustedDomain: Serialize + DeserializeOwned + Send + Sync + Sized {
    const KIND: AttestationKind;

    /// Record with nothing set, before an upsert is applied.
    fn blank(name: &str) -> Self;
    fn name(&self) -> &str;
    fn set_name(&mut self, name: &str);
    fn totp_secret(&self) -> &str;
    fn set_totp_secret(&mut self, secret: String);
    fn token(&self) -> &TokenParams;
    fn token_mut(&mut self) -> &mut TokenParams;

    /// Applies the kind-specific fields present in `fields`.
    fn apply(&mut self, fields: &Fields, errs: &mut MultiError);

    /// Extra requirements on a newly created record.
    fn check_new(&self) -> Result<(), AuthError> {
        Ok(())
    }

    /// Kind-specific fields as shown to administrators.
    fn describe_baseline(&self, out: &mut Fields);

    fn storage_key(name: &str) -> String {
        format!("{}/{}", Self::KIND, name)
    }

    fn alias(&self) -> String {
        format!("{}/{}", Self::KIND, self.name())
    }

    /// Everything but the TOTP secret.
    fn describe(&self) -> Fields {
        let mut out = Fields::new();
        out.insert("name".into(), self.name().into());
        self.describe_baseline(&mut out);
        self.token().describe(&mut out);
        out
    }
}

/// Applies `fields` onto `existing`, or onto a blank record when there is
/// none. Returns the record and whether it was created.
pub fn upsert<T: TrustedDomain>(
    existing: Option<T>,
    name: &str,
    fields: &Fields,
) -> Result<(T, bool), AuthError> {
    let created = existing.is_none();
    let mut record = existing.unwrap_or_else(|| T::blank(name));
    record.set_name(name);

    let mut errs = MultiError::default();
    if let Some(secret) = string_field(fields, "totp_secret", &mut errs) {
        record.set_totp_secret(secret.trim().to_string());
    }
    record.apply(fields, &mut errs);
    record.token_mut().apply(fields, &mut errs);

    if !errs.is_empty() {
        return Err(AuthError::InvalidRequest(format!(
            "failed to read parameters for {} entry: {errs}",
            T::KIND
        )));
    }
    if created {
        record.check_new()?;
    }
    Ok((record, created))
}

/// Stored TDX trusted domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TdxRecord {
    #[serde(skip)]
    pub name: String,
    pub totp_secret: String,
    #[serde(flatten)]
    pub baseline: TdxBaseline,
    #[serde(flatten)]
    pub token: TokenParams,
}

impl TrustedDomain for TdxRecord {
    const KIND: AttestationKind = AttestationKind::Tdx;

    fn blank(name: &str) -> Self {
        TdxRecord {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn totp_secret(&self) -> &str {
        &self.totp_secret
    }

    fn set_totp_secret(&mut self, secret: String) {
        self.totp_secret = secret;
    }

    fn token(&self) -> &TokenParams {
        &self.token
    }

    fn token_mut(&mut self) -> &mut TokenParams {
        &mut self.token
    }

    fn apply(&mut self, fields: &Fields, errs: &mut MultiError) {
        let b = &mut self.baseline;
        let slots = [
            ("tdx_mr_owner", &mut b.mr_owner),
            ("tdx_mr_owner_config", &mut b.mr_owner_config),
            ("tdx_mr_config_id", &mut b.mr_config_id),
            ("tdx_mr_td", &mut b.mr_td),
            ("tdx_rtmr0", &mut b.rtmr0),
            ("tdx_rtmr1", &mut b.rtmr1),
            ("tdx_rtmr2", &mut b.rtmr2),
            ("tdx_rtmr3", &mut b.rtmr3),
        ];
        for (key, slot) in slots {
            if let Some(v) = fixed_field::<48>(fields, key, errs) {
                *slot = v;
            }
        }
        if let Some(v) = bool_field(fields, "tdx_check_debug", errs) {
            b.check_debug = v;
        }
        if let Some(v) = bool_field(fields, "tdx_check_sept_ve_disable", errs) {
            b.check_sept_ve_disable = v;
        }
    }

    fn describe_baseline(&self, out: &mut Fields) {
        if let Ok(Value::Object(map)) = serde_json::to_value(&self.baseline) {
            out.extend(map);
        }
    }
}

/// Stored TPM 2.0 trusted domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tpm2Record {
    #[serde(skip)]
    pub name: String,
    pub totp_secret: String,
    #[serde(flatten)]
    pub baseline: Tpm2Baseline,
    #[serde(flatten)]
    pub token: TokenParams,
}

impl TrustedDomain for Tpm2Record {
    const KIND: AttestationKind = AttestationKind::Tpm2;

    fn blank(name: &str) -> Self {
        Tpm2Record {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn totp_secret(&self) -> &str {
        &self.totp_secret
    }

    fn set_totp_secret(&mut self, secret: String) {
        self.totp_secret = secret;
    }

    fn token(&self) -> &TokenParams {
        &self.token
    }

    fn token_mut(&mut self) -> &mut TokenParams {
        &mut self.token
    }

    fn apply(&mut self, fields: &Fields, errs: &mut MultiError) {
        match string_field(fields, "tpm2_ak_public", errs) {
            Some("") => errs.push(AttnError::Decode("tpm2_ak_public must not be empty".into())),
            Some(s) => match b64.decode(s.as_bytes()) {
                Ok(raw) => self.baseline.ak_public = Bytes(raw),
                Err(e) => errs.push(AttnError::Decode(format!(
                    "tpm2_ak_public is not encoded as base64 string: {e}"
                ))),
            },
            None => {}
        }
        for (idx, slot) in self.baseline.pcrs.iter_mut().enumerate() {
            if let Some(v) = fixed_field::<32>(fields, &format!("tpm2_pcr{idx:02}"), errs) {
                *slot = v;
            }
        }
    }

    fn check_new(&self) -> Result<(), AuthError> {
        if self.baseline.ak_public.is_empty() {
            return Err(AuthError::InvalidRequest(
                "`tpm2_ak_public` field is required".into(),
            ));
        }
        Ok(())
    }

    fn describe_baseline(&self, out: &mut Fields) {
        out.insert(
            "tpm2_ak_public".into(),
            self.baseline.ak_public.to_string().into(),
        );
        for (idx, pcr) in self.baseline.pcrs.iter().enumerate() {
            if let Some(pcr) = pcr {
                out.insert(format!("tpm2_pcr{idx:02}"), pcr.to_string().into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn fields(v: Value) -> Fields {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[rstest]
    #[case("alice", true)]
    #[case("a", true)]
    #[case("node-1.prod@dc", true)]
    #[case("", false)]
    #[case("-alice", false)]
    #[case("alice.", false)]
    #[case("al/ice", false)]
    #[case("..", false)]
    fn domain_names(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_name(name).is_ok(), ok);
    }

    #[test]
    fn create_then_partial_update() {
        let mr_td = b64.encode([7u8; 48]);
        let (rec, created) = upsert::<TdxRecord>(
            None,
            "alice",
            &fields(json!({ "tdx_mr_td": mr_td, "tdx_check_debug": true, "token_ttl": "1h" })),
        )
        .unwrap();
        assert!(created);
        assert_eq!(rec.baseline.mr_td.unwrap().0, [7u8; 48]);
        assert!(rec.baseline.check_debug);
        assert_eq!(rec.token.token_ttl, 3600);

        let rtmr = b64.encode([1u8; 32]);
        let (rec, created) = upsert(
            Some(rec),
            "alice",
            &fields(json!({ "tdx_rtmr2": rtmr, "token_policies": "b, a,b" })),
        )
        .unwrap();
        assert!(!created);
        // untouched fields survive
        assert_eq!(rec.baseline.mr_td.unwrap().0, [7u8; 48]);
        assert!(rec.baseline.check_debug);
        assert_eq!(rec.token.token_ttl, 3600);
        // short values are zero padded
        assert_eq!(&rec.baseline.rtmr2.unwrap().0[..32], &[1u8; 32]);
        assert_eq!(rec.token.token_policies, vec!["a", "b"]);

        let (rec, _) = upsert(Some(rec), "alice", &fields(json!({ "tdx_mr_td": "" }))).unwrap();
        assert!(rec.baseline.mr_td.is_none());
    }

    #[test]
    fn field_errors_are_aggregated() {
        let err = upsert::<TdxRecord>(
            None,
            "alice",
            &fields(json!({
                "tdx_mr_owner": "***",
                "tdx_rtmr1": b64.encode([0u8; 49]),
                "tdx_check_debug": "maybe",
            })),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("failed to read parameters for tdx entry: 3 errors occurred: "));
        assert!(msg.contains("longer than expected max 48 bytes: 49 > 48"));
        assert!(msg.contains("tdx_check_debug must be a boolean"));
    }

    #[test]
    fn tpm2_requires_ak_on_create() {
        let err = upsert::<Tpm2Record>(None, "bob", &Fields::new()).unwrap_err();
        assert_eq!(err.to_string(), "`tpm2_ak_public` field is required");

        let pcr7 = b64.encode([0xA7u8; 32]);
        let (rec, _) = upsert::<Tpm2Record>(
            None,
            "bob",
            &fields(json!({ "tpm2_ak_public": "AQID", "tpm2_pcr07": pcr7 })),
        )
        .unwrap();
        assert_eq!(rec.baseline.ak_public.as_slice(), &[1, 2, 3]);
        assert_eq!(rec.baseline.pcrs[7].unwrap().0, [0xA7; 32]);
        assert_eq!(rec.baseline.pcrs.iter().flatten().count(), 1);

        // an update without the key keeps it
        let (rec, _) = upsert(Some(rec), "bob", &Fields::new()).unwrap();
        assert_eq!(rec.baseline.ak_public.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn pcr_fields_cover_exactly_the_sha256_bank() {
        use td_verifier::attestation::pcr::PCR_COUNT;

        let mut body = json!({
            "tpm2_ak_public": "AQID",
            "tpm2_pcr24": b64.encode([0xEEu8; 32]),
        });
        for idx in 0..PCR_COUNT {
            body[format!("tpm2_pcr{idx:02}")] = json!(b64.encode([idx as u8; 32]));
        }
        let (rec, _) = upsert::<Tpm2Record>(None, "bob", &fields(body)).unwrap();
        assert_eq!(rec.baseline.pcrs.iter().flatten().count(), PCR_COUNT);

        let shown = rec.describe();
        assert_eq!(shown["tpm2_pcr23"], json!(b64.encode([23u8; 32])));
        assert!(!shown.contains_key("tpm2_pcr24"));
    }

    #[test]
    fn storage_round_trip_keeps_fields_but_not_name() {
        let (rec, _) = upsert::<Tpm2Record>(
            None,
            "bob",
            &fields(json!({ "tpm2_ak_public": "AQID", "tpm2_pcr23": b64.encode([3u8; 32]) })),
        )
        .unwrap();
        let raw = serde_json::to_vec(&rec).unwrap();
        let mut back: Tpm2Record = serde_json::from_slice(&raw).unwrap();
        assert!(back.name.is_empty());
        back.set_name("bob");
        assert_eq!(back, rec);
    }

    #[test]
    fn describe_hides_secret() {
        let mut rec = TdxRecord::blank("alice");
        rec.totp_secret = "SECRET".into();
        rec.baseline.mr_owner = Some(FixedBytes([1; 48]));
        let d = rec.describe();
        assert!(!d.contains_key("totp_secret"));
        assert_eq!(d["name"], "alice");
        assert!(d.contains_key("tdx_mr_owner"));
        assert!(!d.contains_key("tdx_mr_td"));
        assert_eq!(rec.alias(), "tdx/alice");
        assert_eq!(TdxRecord::storage_key("alice"), "tdx/alice");
    }
}
