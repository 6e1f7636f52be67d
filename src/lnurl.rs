use async_trait::async_trait;
use bitcoin::bech32::{self, FromBase32};
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use hmac::{Hmac, Mac};
use lightning_invoice::Bolt11Invoice;
use log::debug;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::str::FromStr;

/// An LNURL-pay terms descriptor, as served by the callback host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LnurlPay {
    pub callback: String,
    pub min_sendable: u64,
    pub max_sendable: u64,
    pub metadata: String,
    #[serde(default)]
    pub comment_allowed: Option<u64>,
}

/// An LNURL-withdraw voucher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LnurlWithdraw {
    pub callback: String,
    pub k1: String,
    pub min_withdrawable: u64,
    pub max_withdrawable: u64,
    #[serde(default)]
    pub default_description: String,
}

/// An LNURL-auth challenge, detected from the `tag=login` query parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnurlAuth {
    pub url: String,
    pub domain: String,
    pub k1: String,
}

#[derive(Debug, Clone)]
pub enum Lnurl {
    Auth(LnurlAuth),
    Pay(LnurlPay),
    Withdraw(LnurlWithdraw),
}

impl Lnurl {
    pub fn tag(&self) -> &'static str {
        match self {
            Lnurl::Auth(_) => "login",
            Lnurl::Pay(_) => "payRequest",
            Lnurl::Withdraw(_) => "withdrawRequest",
        }
    }
}

/// What a Lightning Address resolved to.
#[derive(Debug, Clone)]
pub enum AddressPayment {
    Bolt11(Bolt11Invoice),
    Offer(String),
}

/// Resolves Lightning Addresses and drives LNURL flows. External
/// collaborator: the HTTP implementation below is the production one, tests
/// substitute their own.
#[async_trait]
pub trait AddressResolver: Send + Sync + 'static {
    async fn resolve_address(
        &self,
        user: &str,
        domain: &str,
        amount_msat: u64,
        note: Option<&str>,
    ) -> anyhow::Result<AddressPayment>;

    async fn execute_lnurl(&self, encoded: &str) -> anyhow::Result<Lnurl>;

    async fn get_lnurl_pay_invoice(
        &self,
        pay: &LnurlPay,
        amount_msat: u64,
        comment: Option<&str>,
    ) -> anyhow::Result<Bolt11Invoice>;

    async fn send_withdraw_invoice(
        &self,
        withdraw: &LnurlWithdraw,
        invoice: &Bolt11Invoice,
    ) -> anyhow::Result<()>;

    async fn sign_and_send_auth_request(&self, auth: &LnurlAuth) -> anyhow::Result<()>;
}

/// Decodes an LNURL string: bech32 `lnurl1…`, an `https://` URL, or either
/// wrapped in a `lightning:` URI.
pub fn decode_lnurl(encoded: &str) -> anyhow::Result<String> {
    let encoded = encoded.trim();
    let encoded = encoded
        .strip_prefix("lightning:")
        .unwrap_or(encoded)
        .to_string();
    let lowered = encoded.to_lowercase();

    if lowered.starts_with("lnurl1") {
        let (hrp, data, _variant) = bech32::decode(&lowered)?;
        if hrp != "lnurl" {
            anyhow::bail!("not an lnurl: {hrp}");
        }
        let bytes = Vec::<u8>::from_base32(&data)?;
        return Ok(String::from_utf8(bytes)?);
    }
    if lowered.starts_with("https://") || lowered.starts_with("http://") {
        return Ok(encoded);
    }
    anyhow::bail!("unrecognized lnurl: {encoded}")
}

#[derive(Deserialize)]
struct LnurlStatus {
    status: Option<String>,
    reason: Option<String>,
}

fn check_lnurl_status(value: &serde_json::Value) -> anyhow::Result<()> {
    if let Ok(status) = serde_json::from_value::<LnurlStatus>(value.clone()) {
        if status.status.as_deref().map(str::to_uppercase) == Some("ERROR".to_string()) {
            anyhow::bail!(
                "lnurl service error: {}",
                status.reason.unwrap_or_else(|| "unknown".to_string())
            );
        }
    }
    Ok(())
}

/// Production resolver over plain HTTPS. Holds the LNURL-auth hashing key;
/// per-domain linking keys are derived from it with HMAC-SHA256.
pub struct HttpAddressResolver {
    client: reqwest::Client,
    secp: Secp256k1<All>,
    auth_key: [u8; 32],
}

impl HttpAddressResolver {
    pub fn new(auth_key: [u8; 32]) -> HttpAddressResolver {
        HttpAddressResolver {
            client: reqwest::Client::new(),
            secp: Secp256k1::new(),
            auth_key,
        }
    }

    fn linking_key(&self, domain: &str) -> anyhow::Result<SecretKey> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.auth_key)
            .expect("HMAC can take key of any size");
        mac.update(domain.as_bytes());
        let bytes = mac.finalize().into_bytes();
        Ok(SecretKey::from_slice(&bytes)?)
    }

    async fn fetch_json(&self, url: &str) -> anyhow::Result<serde_json::Value> {
        let value: serde_json::Value = self.client.get(url).send().await?.json().await?;
        check_lnurl_status(&value)?;
        Ok(value)
    }
}

#[async_trait]
impl AddressResolver for HttpAddressResolver {
    async fn resolve_address(
        &self,
        user: &str,
        domain: &str,
        amount_msat: u64,
        note: Option<&str>,
    ) -> anyhow::Result<AddressPayment> {
        let url = format!("https://{domain}/.well-known/lnurlp/{user}");
        debug!("resolving lightning address via {url}");
        let value = self.fetch_json(&url).await?;
        if value.get("tag").and_then(|t| t.as_str()) != Some("payRequest") {
            anyhow::bail!("address {user}@{domain} did not resolve to a pay request");
        }
        let pay: LnurlPay = serde_json::from_value(value)?;
        let invoice = self.get_lnurl_pay_invoice(&pay, amount_msat, note).await?;
        Ok(AddressPayment::Bolt11(invoice))
    }

    async fn execute_lnurl(&self, encoded: &str) -> anyhow::Result<Lnurl> {
        let url = decode_lnurl(encoded)?;
        let parsed = Url::parse(&url)?;

        // auth challenges are recognized from the URL itself, no fetch
        if parsed
            .query_pairs()
            .any(|(k, v)| k == "tag" && v == "login")
        {
            let k1 = parsed
                .query_pairs()
                .find(|(k, _)| k == "k1")
                .map(|(_, v)| v.to_string())
                .ok_or_else(|| anyhow::anyhow!("auth url without k1"))?;
            let domain = parsed
                .domain()
                .ok_or_else(|| anyhow::anyhow!("auth url without domain"))?
                .to_string();
            return Ok(Lnurl::Auth(LnurlAuth { url, domain, k1 }));
        }

        let value = self.fetch_json(&url).await?;
        match value.get("tag").and_then(|t| t.as_str()) {
            Some("payRequest") => Ok(Lnurl::Pay(serde_json::from_value(value)?)),
            Some("withdrawRequest") => Ok(Lnurl::Withdraw(serde_json::from_value(value)?)),
            tag => anyhow::bail!("unsupported lnurl tag: {tag:?}"),
        }
    }

    async fn get_lnurl_pay_invoice(
        &self,
        pay: &LnurlPay,
        amount_msat: u64,
        comment: Option<&str>,
    ) -> anyhow::Result<Bolt11Invoice> {
        let mut url = Url::parse(&pay.callback)?;
        url.query_pairs_mut()
            .append_pair("amount", &amount_msat.to_string());
        if let Some(comment) = comment {
            url.query_pairs_mut().append_pair("comment", comment);
        }

        let value = self.fetch_json(url.as_str()).await?;
        let pr = value
            .get("pr")
            .and_then(|p| p.as_str())
            .ok_or_else(|| anyhow::anyhow!("pay callback returned no invoice"))?;
        let invoice = Bolt11Invoice::from_str(pr)
            .map_err(|e| anyhow::anyhow!("pay callback returned a bad invoice: {e}"))?;
        if invoice.amount_milli_satoshis() != Some(amount_msat) {
            anyhow::bail!("pay callback invoice amount does not match the request");
        }
        Ok(invoice)
    }

    async fn send_withdraw_invoice(
        &self,
        withdraw: &LnurlWithdraw,
        invoice: &Bolt11Invoice,
    ) -> anyhow::Result<()> {
        let mut url = Url::parse(&withdraw.callback)?;
        url.query_pairs_mut()
            .append_pair("k1", &withdraw.k1)
            .append_pair("pr", &invoice.to_string());
        self.fetch_json(url.as_str()).await?;
        Ok(())
    }

    async fn sign_and_send_auth_request(&self, auth: &LnurlAuth) -> anyhow::Result<()> {
        let k1 = hex::decode(&auth.k1)?;
        let message = Message::from_slice(&k1)?;
        let key = self.linking_key(&auth.domain)?;
        let signature = self.secp.sign_ecdsa(&message, &key);
        let linking_pubkey = key.public_key(&self.secp);

        let mut url = Url::parse(&auth.url)?;
        url.query_pairs_mut()
            .append_pair("sig", &hex::encode(signature.serialize_der()))
            .append_pair("key", &linking_pubkey.to_string());
        self.fetch_json(url.as_str()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decodes_bech32_lnurl() {
        // bech32("lnurl", "https://service.com/api?q=3fc3645b439ce8e7f2553a69e5267081d96dcd340693afabe04be7b0ccd178df")
        let encoded = "LNURL1DP68GURN8GHJ7UM9WFMXJCM99E3K7MF0V9CXJ0M385EKVCENXC6R2C35XVUKXEFCV5MKVV34X5EKZD3EV56NYD3HXQURZEPEXEJXXEPNXSCRVWFNV9NXZCN9XQ6XYEFHVGCXXCMYXYMNSERXFQ5FNS";
        let url = decode_lnurl(encoded).unwrap();
        assert!(url.starts_with("https://service.com/api?q=3fc3645b"));
    }

    #[test]
    fn passes_through_https_and_strips_lightning_prefix() {
        assert_eq!(
            decode_lnurl("lightning:https://example.com/lnurlp/alice").unwrap(),
            "https://example.com/lnurlp/alice"
        );
        assert!(decode_lnurl("not-a-url").is_err());
    }

    #[test]
    fn linking_keys_differ_per_domain() {
        let resolver = HttpAddressResolver::new([7u8; 32]);
        let a = resolver.linking_key("service-a.com").unwrap();
        let b = resolver.linking_key("service-b.com").unwrap();
        assert_ne!(a.secret_bytes(), b.secret_bytes());
        // deterministic for the same domain
        assert_eq!(
            a.secret_bytes(),
            resolver.linking_key("service-a.com").unwrap().secret_bytes()
        );
    }

    #[test]
    fn lnurl_error_body_is_detected() {
        let value = serde_json::json!({"status": "ERROR", "reason": "no such user"});
        let err = check_lnurl_status(&value).unwrap_err();
        assert!(err.to_string().contains("no such user"));

        let ok = serde_json::json!({"tag": "payRequest"});
        assert!(check_lnurl_status(&ok).is_ok());
    }
}
