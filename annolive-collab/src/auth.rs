//! Token verification.
//!
//! The engine only trusts a connection after the auth collaborator has
//! vouched for its token. [`JwtVerifier`] is the shipped implementation:
//! HS256 tokens carrying `sub`, `name`, `role`, `docs` and `exp`.

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::CollabError;
use crate::protocol::{DocumentKey, Role};

/// Who a verified token belongs to and which documents it may open.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub name: String,
    pub role: Role,
    pub allowed_documents: Vec<String>,
}

impl Identity {
    /// `*` in the allowed list grants every document.
    pub fn may_open(&self, document_id: &str) -> bool {
        self.allowed_documents
            .iter()
            .any(|d| d == "*" || d == document_id)
    }

    /// Pick the document to join: the requested one, else the token's only document.
    pub fn resolve_document(
        &self,
        project_id: &str,
        requested: Option<&str>,
    ) -> Result<DocumentKey, CollabError> {
        let document_id = match requested {
            Some(doc) => doc.to_string(),
            None => match self.allowed_documents.as_slice() {
                [only] if only != "*" => only.clone(),
                _ => {
                    return Err(CollabError::AuthInvalid(
                        "no documentId given and token does not name exactly one document".into(),
                    ))
                }
            },
        };
        if !self.may_open(&document_id) {
            return Err(CollabError::AuthInvalid(format!(
                "token does not grant access to document {document_id}"
            )));
        }
        Ok(DocumentKey::new(project_id, document_id))
    }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, CollabError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub docs: Vec<String>,
    pub exp: u64,
}

pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, CollabError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| CollabError::AuthInvalid(e.to_string()))?;
        let claims = data.claims;
        Ok(Identity {
            name: claims.name.unwrap_or_else(|| claims.sub.clone()),
            user_id: claims.sub,
            role: claims.role,
            allowed_documents: claims.docs,
        })
    }
}

/// Mint an HS256 token. Used by tests and by engine producers sharing the secret.
pub fn issue_token(secret: &str, claims: &Claims) -> Result<String, CollabError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| CollabError::AuthInvalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    fn claims(docs: &[&str]) -> Claims {
        Claims {
            sub: "alice".into(),
            name: Some("Alice".into()),
            role: Role::Reviewer,
            docs: docs.iter().map(|d| d.to_string()).collect(),
            exp: (chrono::Utc::now().timestamp() + 3600) as u64,
        }
    }

    #[tokio::test]
    async fn test_verify_roundtrip() {
        let token = issue_token(SECRET, &claims(&["doc1"])).unwrap();
        let identity = JwtVerifier::new(SECRET).verify(&token).await.unwrap();
        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.name, "Alice");
        assert_eq!(identity.role, Role::Reviewer);
        assert_eq!(identity.allowed_documents, vec!["doc1".to_string()]);
    }

    #[tokio::test]
    async fn test_wrong_secret_and_expiry_rejected() {
        let token = issue_token("other", &claims(&["doc1"])).unwrap();
        let err = JwtVerifier::new(SECRET).verify(&token).await.unwrap_err();
        assert_eq!(err.code(), "AuthInvalid");

        let mut expired = claims(&["doc1"]);
        expired.exp = 1_000;
        let token = issue_token(SECRET, &expired).unwrap();
        assert!(JwtVerifier::new(SECRET).verify(&token).await.is_err());

        assert!(JwtVerifier::new(SECRET).verify("garbage").await.is_err());
    }

    #[test]
    fn test_resolve_document() {
        let identity = Identity {
            user_id: "alice".into(),
            name: "Alice".into(),
            role: Role::Annotator,
            allowed_documents: vec!["doc1".into()],
        };
        assert_eq!(
            identity.resolve_document("p1", None).unwrap(),
            DocumentKey::new("p1", "doc1")
        );
        assert!(identity.resolve_document("p1", Some("doc2")).is_err());

        let wildcard = Identity {
            allowed_documents: vec!["*".into()],
            ..identity
        };
        assert!(wildcard.resolve_document("p1", Some("doc2")).is_ok());
        assert!(wildcard.resolve_document("p1", None).is_err());
    }
}
