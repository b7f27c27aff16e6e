use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use domain::Credential;
use serde_json::Value;
use url::Url;
use uuid::Uuid;
use webauthn_rs::prelude::{
    CredentialID, Passkey, PasskeyAuthentication, PasskeyRegistration, PublicKeyCredential,
    RegisterPublicKeyCredential, Webauthn, WebauthnBuilder,
};

use crate::error::{AuthError, AuthResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignCountMode {
    Strict,
    Lenient,
}

impl SignCountMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "STRICT" => Some(SignCountMode::Strict),
            "LENIENT" => Some(SignCountMode::Lenient),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebauthnSettings {
    pub rp_id: String,
    pub rp_name: String,
    pub origins: Vec<Url>,
    pub challenge_ttl: Duration,
    pub sign_count_mode: SignCountMode,
}

/// Client-facing options plus the opaque in-flight ceremony state that the
/// caller stashes in the challenge cache.
#[derive(Debug)]
pub struct GeneratedChallenge {
    pub options: Value,
    pub state: Value,
}

#[derive(Debug)]
pub struct RegisteredCredential {
    pub credential_id: String,
    pub public_key: Vec<u8>,
    pub sign_count: i64,
    pub aaguid: Option<String>,
    pub transports: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct VerifiedAssertion {
    pub credential_id: String,
    pub new_sign_count: i64,
}

/// Boundary over the WebAuthn primitive. Verification failures are `None`;
/// `Err` is reserved for configuration and storage corruption.
pub trait WebauthnAdapter: Send + Sync {
    fn generate_registration_options(
        &self,
        user_id: Uuid,
        user_name: &str,
        display_name: &str,
        exclude: &[Credential],
    ) -> AuthResult<GeneratedChallenge>;

    fn verify_registration(
        &self,
        response: &Value,
        state: &Value,
    ) -> AuthResult<Option<RegisteredCredential>>;

    fn generate_authentication_options(&self, allow: &[Credential])
        -> AuthResult<GeneratedChallenge>;

    fn verify_authentication(
        &self,
        response: &Value,
        state: &Value,
        stored: &Credential,
    ) -> AuthResult<Option<VerifiedAssertion>>;

    fn challenge_ttl(&self) -> Duration;

    fn sign_count_mode(&self) -> SignCountMode;
}

/// Production adapter backed by `webauthn-rs` passkey ceremonies.
///
/// Stored credentials hold the serialized passkey from registration time;
/// its embedded counter is never advanced, so live counter reconciliation
/// stays entirely with the credential store.
pub struct RelyingParty {
    webauthn: Webauthn,
    settings: WebauthnSettings,
}

impl RelyingParty {
    pub fn new(settings: WebauthnSettings) -> AuthResult<Self> {
        let Some(primary_origin) = settings.origins.first() else {
            return Err(AuthError::Internal(
                "webauthn requires at least one origin".to_string(),
            ));
        };

        let mut builder = WebauthnBuilder::new(&settings.rp_id, primary_origin)
            .map_err(|err| AuthError::Internal(format!("invalid relying party config: {err}")))?
            .rp_name(&settings.rp_name);
        for origin in settings.origins.iter().skip(1) {
            builder = builder.append_allowed_origin(origin);
        }
        let webauthn = builder
            .build()
            .map_err(|err| AuthError::Internal(format!("failed to build relying party: {err}")))?;

        Ok(Self { webauthn, settings })
    }

    fn decode_credential_id(encoded: &str) -> Option<CredentialID> {
        URL_SAFE_NO_PAD
            .decode(encoded)
            .ok()
            .map(CredentialID::from)
    }
}

impl WebauthnAdapter for RelyingParty {
    fn generate_registration_options(
        &self,
        user_id: Uuid,
        user_name: &str,
        display_name: &str,
        exclude: &[Credential],
    ) -> AuthResult<GeneratedChallenge> {
        let exclude_ids: Vec<CredentialID> = exclude
            .iter()
            .filter_map(|cred| Self::decode_credential_id(&cred.credential_id))
            .collect();
        let exclude_ids = if exclude_ids.is_empty() {
            None
        } else {
            Some(exclude_ids)
        };

        let (creation_options, registration_state) = self
            .webauthn
            .start_passkey_registration(user_id, user_name, display_name, exclude_ids)
            .map_err(|err| {
                AuthError::Internal(format!("failed to start registration ceremony: {err}"))
            })?;

        Ok(GeneratedChallenge {
            options: serde_json::to_value(&creation_options)?,
            state: serde_json::to_value(&registration_state)?,
        })
    }

    fn verify_registration(
        &self,
        response: &Value,
        state: &Value,
    ) -> AuthResult<Option<RegisteredCredential>> {
        let Ok(attestation) =
            serde_json::from_value::<RegisterPublicKeyCredential>(response.clone())
        else {
            return Ok(None);
        };
        let registration_state: PasskeyRegistration = serde_json::from_value(state.clone())
            .map_err(|err| AuthError::Internal(format!("corrupt registration state: {err}")))?;

        match self
            .webauthn
            .finish_passkey_registration(&attestation, &registration_state)
        {
            Ok(passkey) => {
                let credential_id = URL_SAFE_NO_PAD.encode(passkey.cred_id());
                let public_key = serde_json::to_vec(&passkey)?;
                // Transports travel in the client payload; attestation policy
                // is `none`, so no attested AAGUID is available.
                let transports = response
                    .pointer("/response/transports")
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|entry| entry.as_str().map(str::to_string))
                            .collect::<Vec<_>>()
                    })
                    .filter(|entries: &Vec<String>| !entries.is_empty());

                Ok(Some(RegisteredCredential {
                    credential_id,
                    public_key,
                    sign_count: 0,
                    aaguid: None,
                    transports,
                }))
            }
            Err(err) => {
                tracing::warn!("registration verification failed: {err}");
                Ok(None)
            }
        }
    }

    fn generate_authentication_options(
        &self,
        allow: &[Credential],
    ) -> AuthResult<GeneratedChallenge> {
        let mut passkeys = Vec::with_capacity(allow.len());
        for cred in allow {
            let passkey: Passkey = serde_json::from_slice(&cred.public_key).map_err(|err| {
                AuthError::Internal(format!(
                    "corrupt stored credential {}: {err}",
                    cred.credential_id
                ))
            })?;
            passkeys.push(passkey);
        }

        let (request_options, authentication_state) = self
            .webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|err| {
                AuthError::Internal(format!("failed to start authentication ceremony: {err}"))
            })?;

        Ok(GeneratedChallenge {
            options: serde_json::to_value(&request_options)?,
            state: serde_json::to_value(&authentication_state)?,
        })
    }

    fn verify_authentication(
        &self,
        response: &Value,
        state: &Value,
        stored: &Credential,
    ) -> AuthResult<Option<VerifiedAssertion>> {
        let Ok(assertion) = serde_json::from_value::<PublicKeyCredential>(response.clone()) else {
            return Ok(None);
        };
        let authentication_state: PasskeyAuthentication = serde_json::from_value(state.clone())
            .map_err(|err| AuthError::Internal(format!("corrupt authentication state: {err}")))?;

        match self
            .webauthn
            .finish_passkey_authentication(&assertion, &authentication_state)
        {
            Ok(result) => {
                let credential_id = URL_SAFE_NO_PAD.encode(result.cred_id());
                if credential_id != stored.credential_id {
                    return Ok(None);
                }
                Ok(Some(VerifiedAssertion {
                    credential_id,
                    new_sign_count: i64::from(result.counter()),
                }))
            }
            Err(err) => {
                tracing::warn!("assertion verification failed: {err}");
                Ok(None)
            }
        }
    }

    fn challenge_ttl(&self) -> Duration {
        self.settings.challenge_ttl
    }

    fn sign_count_mode(&self) -> SignCountMode {
        self.settings.sign_count_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_count_mode_parses_case_insensitively() {
        assert_eq!(SignCountMode::parse("strict"), Some(SignCountMode::Strict));
        assert_eq!(SignCountMode::parse(" LENIENT "), Some(SignCountMode::Lenient));
        assert_eq!(SignCountMode::parse("paranoid"), None);
    }

    #[test]
    fn relying_party_requires_an_origin() {
        let settings = WebauthnSettings {
            rp_id: "wallet.example".to_string(),
            rp_name: "Wallet".to_string(),
            origins: Vec::new(),
            challenge_ttl: Duration::from_secs(60),
            sign_count_mode: SignCountMode::Strict,
        };
        assert!(RelyingParty::new(settings).is_err());
    }

    #[test]
    fn relying_party_builds_from_valid_settings() {
        let settings = WebauthnSettings {
            rp_id: "wallet.example".to_string(),
            rp_name: "Wallet".to_string(),
            origins: vec![Url::parse("https://wallet.example").unwrap()],
            challenge_ttl: Duration::from_secs(60),
            sign_count_mode: SignCountMode::Strict,
        };
        let rp = RelyingParty::new(settings).expect("relying party");
        assert_eq!(rp.sign_count_mode(), SignCountMode::Strict);
        assert_eq!(rp.challenge_ttl(), Duration::from_secs(60));
    }
}
