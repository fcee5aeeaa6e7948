//! Token Service: minting and verification of signed access, refresh and ID
//! tokens.
//!
//! Tokens are RS256 JWTs so resource servers can verify them with the public
//! key alone. Verification accepts the current and (when configured) the
//! previous public key, which lets the key pair rotate without invalidating
//! in-flight tokens.
//!
//! The blacklist lookup is deliberately a separate step after signature
//! verification, not folded into it, so the two checks stay independently
//! auditable. All verification failures collapse into one caller-visible
//! error; the concrete reason is only surfaced through tracing.

use crate::config::JwtConfig;
use crate::store::{StateStore, StoreError};
use crate::utils::random_token;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rsa::RsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use utoipa::ToSchema;

const BLACKLIST_PREFIX: &str = "blacklist:";
const REFRESH_PREFIX: &str = "refresh:";

/// Why a token failed verification. Never shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailure {
    BadSignature,
    Expired,
    Blacklisted,
    WrongUse,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token verification failed")]
    Invalid(VerifyFailure),
    #[error("token signing failed: {0}")]
    Signing(jsonwebtoken::errors::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a token is for. Redeeming a token outside its use is rejected even
/// when the signature is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenUse {
    Access,
    Refresh,
    Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    /// Subject: the user id.
    pub sub: String,
    /// Audience: the client id the token was issued to.
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    /// Unique token identifier, the blacklisting handle.
    pub jti: String,
    pub token_use: TokenUse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,
}

/// A freshly minted token plus the metadata callers need to track it.
#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: OffsetDateTime,
}

/// Server-side record for a live refresh token, keyed by `jti`.
///
/// Presence in the store is what makes a refresh token redeemable; rotation
/// removes the record atomically so a replayed token finds nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub jti: String,
    pub user_id: String,
    pub client_id: String,
    pub scope: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub rotated_from: Option<String>,
}

/// One RSA public key in JWK form (RFC 7517).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
    pub kid: String,
    /// Modulus, base64url without padding.
    pub n: String,
    /// Public exponent, base64url without padding.
    pub e: String,
}

/// The key set served at `/.well-known/jwks.json`: the current signing key
/// plus, during rotation, the previous one.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Signing/verification key material, read once at startup and immutable
/// afterwards.
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    previous_decoding: Option<DecodingKey>,
    /// Key id of the current signing key, stamped into JWT headers.
    kid: String,
    jwks: JwkSet,
}

impl TokenKeys {
    pub fn from_pem(
        private_pem: &[u8],
        public_pem: &[u8],
        previous_public_pem: Option<&[u8]>,
    ) -> Result<Self, jsonwebtoken::errors::Error> {
        let current_jwk = jwk_from_public_pem(public_pem)?;
        let kid = current_jwk.kid.clone();
        let mut keys = vec![current_jwk];
        if let Some(pem) = previous_public_pem {
            keys.push(jwk_from_public_pem(pem)?);
        }
        Ok(Self {
            encoding: EncodingKey::from_rsa_pem(private_pem)?,
            decoding: DecodingKey::from_rsa_pem(public_pem)?,
            previous_decoding: previous_public_pem
                .map(DecodingKey::from_rsa_pem)
                .transpose()?,
            kid,
            jwks: JwkSet { keys },
        })
    }
}

fn jwk_from_public_pem(pem: &[u8]) -> Result<Jwk, jsonwebtoken::errors::Error> {
    fn invalid() -> jsonwebtoken::errors::Error {
        jsonwebtoken::errors::ErrorKind::InvalidKeyFormat.into()
    }
    let pem = std::str::from_utf8(pem).map_err(|_| invalid())?;
    let key = RsaPublicKey::from_public_key_pem(pem).map_err(|_| invalid())?;
    let n = key.n().to_bytes_be();
    let e = key.e().to_bytes_be();

    // The key id is a digest of the public parameters, so it is stable
    // across restarts without any coordination.
    let mut hasher = Sha256::new();
    hasher.update(&n);
    hasher.update(&e);
    let kid = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&hasher.finalize()[..16]);

    let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    Ok(Jwk {
        kty: "RSA".to_string(),
        key_use: "sig".to_string(),
        alg: "RS256".to_string(),
        kid,
        n: b64.encode(n),
        e: b64.encode(e),
    })
}

#[derive(Clone)]
pub struct TokenService {
    keys: Arc<TokenKeys>,
    store: Arc<dyn StateStore>,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    id_ttl: Duration,
}

impl TokenService {
    pub fn new(
        keys: TokenKeys,
        store: Arc<dyn StateStore>,
        issuer: String,
        jwt: &JwtConfig,
    ) -> Self {
        Self {
            keys: Arc::new(keys),
            store,
            issuer,
            access_ttl: Duration::from_secs(jwt.access_token_ttl_secs),
            refresh_ttl: Duration::from_secs(jwt.refresh_token_ttl_secs),
            id_ttl: Duration::from_secs(jwt.id_token_ttl_secs),
        }
    }

    pub fn access_token_lifetime(&self) -> Duration {
        self.access_ttl
    }

    /// The published verification keys.
    pub fn jwks(&self) -> JwkSet {
        self.keys.jwks.clone()
    }

    fn mint(
        &self,
        user_id: &str,
        client_id: &str,
        token_use: TokenUse,
        ttl: Duration,
        scope: Option<&str>,
        nonce: Option<&str>,
        auth_time: Option<i64>,
    ) -> Result<SignedToken, TokenError> {
        let now = OffsetDateTime::now_utc();
        let expires_at = now + ttl;
        let jti = random_token();
        let claims = Claims {
            iss: self.issuer.clone(),
            sub: user_id.to_string(),
            aud: client_id.to_string(),
            exp: expires_at.unix_timestamp(),
            iat: now.unix_timestamp(),
            jti: jti.clone(),
            token_use,
            scope: scope.map(String::from),
            nonce: nonce.map(String::from),
            auth_time,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.keys.kid.clone());
        let token = encode(&header, &claims, &self.keys.encoding).map_err(TokenError::Signing)?;
        Ok(SignedToken {
            token,
            jti,
            expires_at,
        })
    }

    /// Mint a short-lived access token carrying `sub`, `aud` and `scope`.
    pub fn mint_access_token(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
    ) -> Result<SignedToken, TokenError> {
        self.mint(
            user_id,
            client_id,
            TokenUse::Access,
            self.access_ttl,
            Some(scope),
            None,
            None,
        )
    }

    /// Mint an OIDC ID token. `nonce` is echoed verbatim when the
    /// authorization request supplied one (replay protection), `auth_time`
    /// is when the user actually authenticated.
    pub fn mint_id_token(
        &self,
        user_id: &str,
        client_id: &str,
        nonce: Option<&str>,
        auth_time: i64,
    ) -> Result<SignedToken, TokenError> {
        self.mint(
            user_id,
            client_id,
            TokenUse::Id,
            self.id_ttl,
            None,
            nonce,
            Some(auth_time),
        )
    }

    /// Mint a refresh token and persist its server-side record. The record
    /// in the store is what keeps the token redeemable; `rotated_from` links
    /// the rotation chain for audit.
    pub fn mint_refresh_token(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
        rotated_from: Option<&str>,
    ) -> Result<SignedToken, TokenError> {
        let signed = self.mint(
            user_id,
            client_id,
            TokenUse::Refresh,
            self.refresh_ttl,
            Some(scope),
            None,
            None,
        )?;
        let record = RefreshTokenRecord {
            jti: signed.jti.clone(),
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            scope: scope.to_string(),
            issued_at: OffsetDateTime::now_utc().unix_timestamp(),
            expires_at: signed.expires_at.unix_timestamp(),
            rotated_from: rotated_from.map(String::from),
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.store
            .put(&refresh_key(&signed.jti), value, self.refresh_ttl)?;
        Ok(signed)
    }

    fn decode_with(&self, token: &str, key: &DecodingKey) -> Result<Claims, VerifyFailure> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&[&self.issuer]);
        match decode::<Claims>(token, key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(VerifyFailure::Expired),
                _ => Err(VerifyFailure::BadSignature),
            },
        }
    }

    /// Verify signature (current key, then previous), expiry, expected use,
    /// and finally the blacklist. All rejections look identical to the
    /// caller; the reason is logged here.
    pub fn verify(&self, token: &str, expected: TokenUse) -> Result<Claims, TokenError> {
        let claims = match self.decode_with(token, &self.keys.decoding) {
            Ok(claims) => Ok(claims),
            Err(VerifyFailure::BadSignature) => {
                if let Some(previous) = &self.keys.previous_decoding {
                    self.decode_with(token, previous)
                } else {
                    Err(VerifyFailure::BadSignature)
                }
            }
            Err(other) => Err(other),
        };
        let claims = claims.map_err(|failure| {
            tracing::warn!(reason = ?failure, "token verification failed");
            TokenError::Invalid(failure)
        })?;

        if claims.token_use != expected {
            tracing::warn!(
                jti = %claims.jti,
                got = ?claims.token_use,
                expected = ?expected,
                "token presented outside its use"
            );
            return Err(TokenError::Invalid(VerifyFailure::WrongUse));
        }

        // Blacklist check is a separate, fail-closed store lookup.
        if self.store.get(&blacklist_key(&claims.jti))?.is_some() {
            tracing::warn!(jti = %claims.jti, "blacklisted token presented");
            return Err(TokenError::Invalid(VerifyFailure::Blacklisted));
        }

        Ok(claims)
    }

    /// Decode a token with a valid signature but without enforcing expiry.
    /// Used by the revocation endpoint, which accepts expired tokens.
    pub fn peek_claims(&self, token: &str) -> Option<Claims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["iss"]);
        validation.set_issuer(&[&self.issuer]);
        let decoded = decode::<Claims>(token, &self.keys.decoding, &validation).or_else(|_| {
            match &self.keys.previous_decoding {
                Some(previous) => decode::<Claims>(token, previous, &validation),
                None => decode::<Claims>(token, &self.keys.decoding, &validation),
            }
        });
        decoded.ok().map(|data| data.claims)
    }

    /// Blacklist `jti` until the token would have expired anyway. A token
    /// already past `exp` needs no entry; the signature check rejects it.
    pub fn revoke(&self, jti: &str, expires_at: i64) -> Result<(), TokenError> {
        let remaining = expires_at - OffsetDateTime::now_utc().unix_timestamp();
        if remaining > 0 {
            self.store.put(
                &blacklist_key(jti),
                "revoked".to_string(),
                Duration::from_secs(remaining as u64),
            )?;
        }
        // A revoked refresh token must also stop being redeemable.
        self.store.delete(&refresh_key(jti))?;
        Ok(())
    }

    /// Atomically consume the refresh record for `jti`. This is the
    /// single-use point of refresh rotation: a second caller gets `None`.
    pub fn take_refresh_record(
        &self,
        jti: &str,
    ) -> Result<Option<RefreshTokenRecord>, TokenError> {
        let Some(raw) = self.store.take(&refresh_key(jti))? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::error!(jti = %jti, error = %e, "corrupt refresh-token record");
                Ok(None)
            }
        }
    }
}

fn blacklist_key(jti: &str) -> String {
    format!("{BLACKLIST_PREFIX}{jti}")
}

fn refresh_key(jti: &str) -> String {
    format!("{REFRESH_PREFIX}{jti}")
}
