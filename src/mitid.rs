//
// MitID protocol client.
//
// Drives the MitID "core-client" and "code-app-auth" REST surfaces end to
// end: session fetch, identify, authenticator selection, init-auth, the
// long-poll loop, the SRP handshake, verify, and finalization.

use std::time::{Duration, Instant};

use data_encoding::{BASE64, HEXLOWER};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::err_sentinel;
use crate::error::Error;
use crate::http_client;
use crate::qr::{QrManager, QrStatus};
use crate::srp::SrpClient;

const POLL_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticatorMethod {
    App,
}

/// The MitID "core client" session metadata fetched at construction time,
/// needed later for the `flowValueProof`.
#[derive(Debug, Clone, Deserialize)]
struct SessionInfo {
    #[serde(rename = "brokerSecurityContext")]
    broker_security_context: String,
    #[serde(rename = "serviceProviderName")]
    service_provider_name: String,
    #[serde(rename = "referenceTextHeader")]
    reference_text_header: String,
    #[serde(rename = "referenceTextBody")]
    reference_text_body: String,
}

#[derive(Debug, Deserialize)]
struct IdentifyResponse {
    #[serde(rename = "errorCode", default)]
    error_code: String,
    #[serde(rename = "authenticationSessionId", default)]
    authentication_session_id: String,
}

#[derive(Debug, Deserialize)]
struct InitAuthResponse {
    #[serde(rename = "errorCode", default)]
    error_code: String,
    #[serde(rename = "pollUrl", default)]
    poll_url: String,
    #[serde(rename = "ticket", default)]
    ticket: String,
    #[serde(rename = "channelBindingValueAppSwitch", default)]
    channel_binding_value_app_switch: Option<String>,
}

#[derive(Debug, Serialize)]
struct PollRequest<'a> {
    ticket: &'a str,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    state: String,
    #[serde(rename = "errorCode", default)]
    error_code: String,
    #[serde(rename = "ticket", default)]
    ticket: Option<String>,
    #[serde(rename = "channelBindingValue", default)]
    channel_binding_value: Option<String>,
    #[serde(rename = "updateCount", default)]
    update_count: u32,
    #[serde(default)]
    confirmation: bool,
    #[serde(default)]
    response: Option<String>,
    #[serde(rename = "responseSignature", default)]
    response_signature: Option<String>,
    #[serde(rename = "sessionFlowKey", default)]
    session_flow_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct SrpInitRequest<'a> {
    #[serde(rename = "publicA")]
    public_a: &'a str,
}

#[derive(Debug, Deserialize)]
struct SrpInitResponse {
    #[serde(rename = "errorCode", default)]
    error_code: String,
    #[serde(rename = "srpSalt", default)]
    srp_salt: String,
    #[serde(rename = "publicB", default)]
    public_b: String,
    #[serde(rename = "sessionId", default)]
    session_id: String,
}

#[derive(Debug, Serialize)]
struct SrpProveRequest<'a> {
    #[serde(rename = "clientProof")]
    client_proof: &'a str,
}

#[derive(Debug, Deserialize)]
struct SrpProveResponse {
    #[serde(rename = "errorCode", default)]
    error_code: String,
}

#[derive(Debug, Serialize)]
struct SrpVerifyRequest<'a> {
    #[serde(rename = "encAuth")]
    enc_auth: &'a str,
}

#[derive(Debug, Deserialize)]
struct SrpVerifyResponse {
    #[serde(rename = "errorCode", default)]
    error_code: String,
    #[serde(rename = "serverProof", default)]
    server_proof: String,
}

#[derive(Debug, Deserialize)]
struct NextResponse {
    #[serde(rename = "errorCode", default)]
    error_code: String,
    #[serde(rename = "continueText", default)]
    continue_text: Option<String>,
    #[serde(rename = "authenticatorContext", default)]
    authenticator_context: Option<String>,
    #[serde(rename = "nextSessionId", default)]
    next_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FinalizationResponse {
    #[serde(rename = "errorCode", default)]
    error_code: String,
    #[serde(rename = "authorizationCode", default)]
    authorization_code: Option<String>,
}

/// Classifies a server `errorCode` into the protocol's sentinel taxonomy
/// Unrecognized codes fall back to a generic error so the
/// caller still sees the server's own message.
fn classify_error_code(code: &str, message: &str) -> Error {
    match code {
        "USER_NOT_FOUND" => Error::sentinel(Error::UserNotFound, "UserNotFound", message),
        "SESSION_NOT_FOUND" => Error::sentinel(Error::SessionNotFound, "SessionNotFound", message),
        "IP_BLOCKED" => Error::sentinel(Error::IpBlocked, "IpBlocked", message),
        "PARALLEL_SESSIONS" => Error::sentinel(Error::ParallelSessions, "ParallelSessions", message),
        "AUTHENTICATOR_NOT_AVAILABLE" => Error::sentinel(Error::AuthenticatorNotAvailable, "AuthenticatorNotAvailable", message),
        "AUTHENTICATOR_CANNOT_START" => Error::sentinel(Error::AuthenticatorCannotStart, "AuthenticatorCannotStart", message),
        "LOGIN_REJECTED" => Error::sentinel(Error::LoginRejected, "LoginRejected", message),
        "INVALID_PASSWORD" => Error::sentinel(Error::InvalidPassword, "InvalidPassword", message),
        "INVALID_TOKEN" => Error::sentinel(Error::InvalidToken, "InvalidToken", message),
        _ => Error::new(message, format!("unclassified MitID errorCode: {code}")),
    }
}

fn check_error_code(error_code: &str, user_message: Option<&str>) -> Result<(), Error> {
    if error_code.is_empty() {
        return Ok(());
    }
    Err(classify_error_code(error_code, user_message.unwrap_or(error_code)))
}

/// Outcome of the final successful authentication: the authorization code
/// threaded onward to the Nordnet/Signicat adapter.
pub struct MitIdOutcome {
    pub authorization_code: String,
}

/// One instance per authentication attempt. Owns the SRP state
/// for its lifetime and never exposes `a`/`K` beyond the SRP engine itself.
pub struct MitIdClient {
    base_url: String,
    http: Client,
    session_info: Option<SessionInfo>,
    auth_session_id: String,
}

impl MitIdClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        Ok(Self {
            base_url: base_url.into(),
            http: http_client::plain_client()?,
            session_info: None,
            auth_session_id: String::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `[Fetched]`: fetches the authentication session and stores the
    /// metadata needed later for `flowValueProof`.
    async fn fetch_session(&mut self) -> Result<(), Error> {
        let resp = self.http.get(self.url("/mitid-core-client-backend/v1/sessions/current")).send().await?;
        let info: SessionInfo = resp.json().await?;
        self.session_info = Some(info);
        Ok(())
    }

    /// `[Fetched] -> [Identified]`.
    async fn identify(&mut self, user_id: &str) -> Result<(), Error> {
        let resp = self
            .http
            .post(self.url("/mitid-core-client-backend/v1/identify"))
            .json(&serde_json::json!({ "userId": user_id }))
            .send()
            .await?;
        let body: IdentifyResponse = resp.json().await?;
        check_error_code(&body.error_code, None)?;
        self.auth_session_id = body.authentication_session_id;
        Ok(())
    }

    /// `[Identified] -> [AuthenticatorSelected] -> [Polling]`. Returns the
    /// poll URL and, if already present, the app-switch channel binding
    /// value (a newer-MitID-behaviour trigger).
    async fn init_auth(&self, method: AuthenticatorMethod) -> Result<InitAuthResponse, Error> {
        let AuthenticatorMethod::App = method;
        let resp = self
            .http
            .post(self.url(&format!(
                "/mitid-code-app-auth/v1/authenticator-sessions/web/{}/init-auth",
                self.auth_session_id
            )))
            .json(&serde_json::json!({ "authenticatorType": "APP" }))
            .send()
            .await?;
        let body: InitAuthResponse = resp.json().await?;
        check_error_code(&body.error_code, None)?;
        Ok(body)
    }

    async fn poll_once(&self, poll_url: &str, ticket: &str) -> Result<PollResponse, Error> {
        let resp = self.http.post(poll_url).json(&PollRequest { ticket }).send().await?;
        let body: PollResponse = resp.json().await?;
        check_error_code(&body.error_code, None)?;
        Ok(body)
    }

    /// Runs the full APP authentication flow against an already-identified
    /// session, returning the Signicat/Nordnet authorization code.
    pub async fn authenticate_app(&mut self, user_id: &str, qr: &std::sync::Arc<QrManager>) -> Result<MitIdOutcome, Error> {
        self.fetch_session().await?;
        self.identify(user_id).await?;

        let init = self.init_auth(AuthenticatorMethod::App).await?;
        let poll_url = init.poll_url.clone();

        let mut qr_generated = false;
        if let Some(binding) = &init.channel_binding_value_app_switch {
            qr.generate(binding, 0)?;
            qr.start_animator().await;
            qr_generated = true;
        } else {
            qr.set_status(QrStatus::Initializing)?;
        }

        let deadline = Instant::now() + POLL_DEADLINE;
        let mut ticket = init.ticket.clone();

        let poll_final = loop {
            if Instant::now() >= deadline {
                err_sentinel!(Timeout, "MitID poll deadline exceeded");
            }

            let poll = self.poll_once(&poll_url, &ticket).await?;
            if let Some(next_ticket) = &poll.ticket {
                ticket = next_ticket.clone();
            }

            match poll.state.as_str() {
                "timeout" => continue,
                "channel_validation_tqr" => {
                    if !qr_generated {
                        if let Some(binding) = &poll.channel_binding_value {
                            qr.generate(binding, poll.update_count)?;
                            qr.start_animator().await;
                            qr_generated = true;
                        }
                    }
                    continue;
                }
                "channel_verified" => {
                    qr.stop_animator().await;
                    qr.set_status(QrStatus::WaitingApproval)?;
                    continue;
                }
                "OK" if poll.confirmation => {
                    qr.set_status(QrStatus::Approved)?;
                    break poll;
                }
                _ => continue,
            }
        };

        let response = poll_final.response.ok_or_else(|| {
            Error::new("MitID did not return authentication payload", "missing `response` field after confirmation")
        })?;
        let response_signature = poll_final.response_signature.ok_or_else(|| {
            Error::new("MitID did not return a response signature", "missing `responseSignature` field after confirmation")
        })?;
        let session_flow_key = poll_final.session_flow_key.unwrap_or_default();

        let outcome = self
            .srp_exchange(user_id, &response, &session_flow_key, &response_signature)
            .await?;

        qr.set_status(QrStatus::Complete)?;
        Ok(outcome)
    }

    /// `[Polling] -> [SRPExchange] -> [Verified]`.
    async fn srp_exchange(
        &self,
        user_id: &str,
        response: &str,
        session_flow_key: &str,
        response_signature: &str,
    ) -> Result<MitIdOutcome, Error> {
        // SRP password input: hex(SHA256(base64_decode(response) ‖ session_flow_key))
        let response_bytes = decode_base64_flexible(response)?;
        let mut password_input = response_bytes;
        password_input.extend_from_slice(session_flow_key.as_bytes());
        let password_hex = HEXLOWER.encode(&crypto::sha256(&password_input));

        let srp = SrpClient::stage1();

        let init_resp: SrpInitResponse = {
            let resp = self
                .http
                .post(self.url(&format!(
                    "/mitid-code-app-auth/v1/authenticator-sessions/web/{}/init",
                    self.auth_session_id
                )))
                .json(&SrpInitRequest { public_a: &srp.a_hex() })
                .send()
                .await?;
            resp.json().await?
        };
        check_error_code(&init_resp.error_code, None)?;

        let stage3 = srp.stage3(&init_resp.srp_salt, &init_resp.public_b, &password_hex, &init_resp.session_id)?;

        let prove_resp: SrpProveResponse = {
            let resp = self
                .http
                .post(self.url(&format!(
                    "/mitid-code-app-auth/v1/authenticator-sessions/web/{}/prove",
                    self.auth_session_id
                )))
                .json(&SrpProveRequest { client_proof: &stage3.m1_hex })
                .send()
                .await?;
            resp.json().await?
        };
        check_error_code(&prove_resp.error_code, None)?;

        // `encAuth = AES-GCM-encrypt(base64_decode(response_signature), K)`.
        let signature_bytes = decode_base64_flexible(response_signature)?;
        let enc_auth = crypto::aes_gcm_encrypt(&signature_bytes, stage3.session_key())?;

        let verify_resp: SrpVerifyResponse = {
            let resp = self
                .http
                .post(self.url(&format!(
                    "/mitid-code-app-auth/v1/authenticator-sessions/web/{}/verify",
                    self.auth_session_id
                )))
                .json(&SrpVerifyRequest { enc_auth: &enc_auth })
                .send()
                .await?;
            resp.json().await?
        };
        check_error_code(&verify_resp.error_code, None)?;

        srp.stage5(&stage3, &verify_resp.server_proof)?;

        self.finalize(&stage3, user_id).await
    }

    /// `[Verified] -> [AuthenticatorFinalized] -> [AuthCodeObtained]`.
    async fn finalize(&self, stage3: &crate::srp::Stage3Output, _user_id: &str) -> Result<MitIdOutcome, Error> {
        let mut next_session_id = self.auth_session_id.clone();

        loop {
            let resp = self
                .http
                .post(self.url(&format!(
                    "/mitid-code-app-auth/v1/authenticator-sessions/web/{next_session_id}/next"
                )))
                .send()
                .await?;
            let body: NextResponse = resp.json().await?;
            check_error_code(&body.error_code, None)?;

            // Empty errorCode with continueText/authenticatorContext is a
            // retryable continuation, not an error.
            if body.continue_text.is_some() || body.authenticator_context.is_some() {
                if let Some(next) = body.next_session_id {
                    next_session_id = next;
                }
                continue;
            }

            let Some(next) = body.next_session_id else {
                err_sentinel!(FinalizationFailed, "missing nextSessionId after /next");
            };

            let fin_resp = self
                .http
                .put(self.url(&format!("/mitid-code-app-auth/v1/authenticator-sessions/web/{next}/finalization")))
                .send()
                .await?;
            let fin_body: FinalizationResponse = fin_resp.json().await?;
            check_error_code(&fin_body.error_code, None)?;

            let Some(code) = fin_body.authorization_code else {
                err_sentinel!(FinalizationFailed, "missing authorizationCode after finalization");
            };

            let _ = stage3;
            return Ok(MitIdOutcome { authorization_code: code });
        }
    }

    /// `proof_bytes` for `flowValueProof`, used by the Signicat adapter when it
    /// needs to re-derive the same proof over the session metadata this
    /// client fetched.
    pub fn flow_value_proof(&self, auth_sess_id: &str, flow_key: &str, client_hash: &str, eafe_hash: &str, session_key: &[u8; 32]) -> Result<String, Error> {
        let info = self.session_info.as_ref().ok_or_else(|| Error::new("MitID session not fetched", "flow_value_proof called before fetch_session"))?;

        let mut proof_bytes = Vec::new();
        proof_bytes.extend_from_slice(auth_sess_id.as_bytes());
        proof_bytes.extend_from_slice(b",");
        proof_bytes.extend_from_slice(flow_key.as_bytes());
        proof_bytes.extend_from_slice(b",");
        proof_bytes.extend_from_slice(client_hash.as_bytes());
        proof_bytes.extend_from_slice(b",");
        proof_bytes.extend_from_slice(eafe_hash.as_bytes());
        proof_bytes.extend_from_slice(b",");
        proof_bytes.extend_from_slice(crypto::sha256_hex(info.broker_security_context.as_bytes()).as_bytes());
        proof_bytes.extend_from_slice(b",");
        proof_bytes.extend_from_slice(BASE64.encode(info.reference_text_header.as_bytes()).as_bytes());
        proof_bytes.extend_from_slice(b",");
        proof_bytes.extend_from_slice(BASE64.encode(info.reference_text_body.as_bytes()).as_bytes());
        proof_bytes.extend_from_slice(b",");
        proof_bytes.extend_from_slice(BASE64.encode(info.service_provider_name.as_bytes()).as_bytes());

        let key = crypto::proof_key("flowValues", session_key);
        Ok(crypto::hmac_sha256_hex(&key, &proof_bytes))
    }
}

/// Decodes base64 trying unpadded first, then padded (`=` pads to a multiple
/// of 4), matching how MitID encodes `response_signature`.
pub fn decode_base64_flexible(input: &str) -> Result<Vec<u8>, Error> {
    use data_encoding::BASE64_NOPAD;

    if let Ok(decoded) = BASE64_NOPAD.decode(input.trim_end_matches('=').as_bytes()) {
        return Ok(decoded);
    }

    let mut padded = input.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    BASE64.decode(padded.as_bytes()).map_err(|_| Error::sentinel(Error::InvalidToken, "InvalidToken", "invalid base64 in MitID response"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_error_codes() {
        let err = classify_error_code("USER_NOT_FOUND", "not found");
        assert!(matches!(err, Error::UserNotFound(_, _)));
        let err = classify_error_code("IP_BLOCKED", "blocked");
        assert!(matches!(err, Error::IpBlocked(_, _)));
    }

    #[test]
    fn unrecognized_error_code_falls_back_to_generic() {
        let err = classify_error_code("SOMETHING_NEW", "message");
        assert!(matches!(err, Error::SimpleError(_, _)));
    }

    #[test]
    fn empty_error_code_is_ok() {
        assert!(check_error_code("", None).is_ok());
    }

    #[test]
    fn decode_base64_flexible_handles_unpadded_and_padded() {
        let unpadded = "aGVsbG8"; // "hello" without padding
        assert_eq!(decode_base64_flexible(unpadded).unwrap(), b"hello");

        let padded = "aGVsbG8=";
        assert_eq!(decode_base64_flexible(padded).unwrap(), b"hello");
    }

    #[test]
    fn decode_base64_flexible_rejects_garbage() {
        assert!(decode_base64_flexible("not base64 at all!!").is_err());
    }
}
