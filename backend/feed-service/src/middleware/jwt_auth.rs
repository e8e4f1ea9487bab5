use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use event_schema::serde_helpers::flexible_id;
use futures::future::{ready, Ready};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;

use crate::clients::UpstreamClient;
use crate::error::AppError;

/// Authenticated user extracted from the bearer token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub i64);

/// The raw bearer credential, forwarded to upstream services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken(pub String);

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(with = "flexible_id")]
    sub: i64,
    #[serde(default, rename = "type")]
    token_type: Option<String>,
}

/// How bearer tokens are checked
#[derive(Clone)]
pub enum TokenVerifier {
    Local {
        key: DecodingKey,
        validation: Validation,
    },
    /// Delegated to the auth service
    Remote(Arc<dyn UpstreamClient>),
}

impl TokenVerifier {
    pub fn local(secret: &str, algorithm: &str) -> Result<Self, AppError> {
        let algorithm = Algorithm::from_str(algorithm).map_err(|_| {
            AppError::Internal(format!("unsupported JWT algorithm: {}", algorithm))
        })?;
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(AppError::Internal(format!(
                "JWT algorithm {:?} needs a public key, only HMAC secrets are supported",
                algorithm
            )));
        }

        Ok(TokenVerifier::Local {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(algorithm),
        })
    }

    pub fn remote(client: Arc<dyn UpstreamClient>) -> Self {
        TokenVerifier::Remote(client)
    }

    /// Resolve a token to its user id.
    pub async fn verify(&self, token: &str) -> Result<i64, AppError> {
        match self {
            TokenVerifier::Local { key, validation } => {
                let data = decode::<Claims>(token, key, validation).map_err(|e| {
                    tracing::warn!("JWT validation failed: {}", e);
                    AppError::InvalidCredential(format!("Invalid token: {}", e))
                })?;

                match data.claims.token_type.as_deref() {
                    None | Some("access") => Ok(data.claims.sub),
                    Some(other) => Err(AppError::InvalidCredential(format!(
                        "Invalid token type: {}",
                        other
                    ))),
                }
            }
            TokenVerifier::Remote(client) => {
                let user = client.verify_token(token).await.map_err(|e| {
                    tracing::warn!("Remote token verification failed: {}", e);
                    AppError::from(e)
                })?;
                Ok(user.sub)
            }
        }
    }
}

/// JWT Authentication Middleware
#[derive(Clone)]
pub struct JwtAuthMiddleware {
    verifier: Arc<TokenVerifier>,
}

impl JwtAuthMiddleware {
    pub fn new(verifier: Arc<TokenVerifier>) -> Self {
        Self { verifier }
    }
}

impl<S, B> Transform<S, ServiceRequest> for JwtAuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = JwtAuthMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(JwtAuthMiddlewareService {
            service: Rc::new(service),
            verifier: self.verifier.clone(),
        }))
    }
}

pub struct JwtAuthMiddlewareService<S> {
    service: Rc<S>,
    verifier: Arc<TokenVerifier>,
}

impl<S, B> Service<ServiceRequest> for JwtAuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let verifier = self.verifier.clone();

        Box::pin(async move {
            let auth_header = req
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".into()))?;

            let token = auth_header
                .strip_prefix("Bearer ")
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    AppError::Unauthorized("Invalid Authorization header format".into())
                })?
                .to_string();

            let user_id = verifier.verify(&token).await?;

            req.extensions_mut().insert(UserId(user_id));
            req.extensions_mut().insert(BearerToken(token));

            service.call(req).await
        })
    }
}

impl actix_web::FromRequest for UserId {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(
        req: &actix_web::HttpRequest,
        _payload: &mut actix_web::dev::Payload,
    ) -> Self::Future {
        match req.extensions().get::<UserId>() {
            Some(user_id) => ready(Ok(*user_id)),
            None => ready(Err(AppError::Unauthorized("User not authenticated".into()).into())),
        }
    }
}

impl actix_web::FromRequest for BearerToken {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(
        req: &actix_web::HttpRequest,
        _payload: &mut actix_web::dev::Payload,
    ) -> Self::Future {
        match req.extensions().get::<BearerToken>() {
            Some(token) => ready(Ok(token.clone())),
            None => ready(Err(AppError::Unauthorized("User not authenticated".into()).into())),
        }
    }
}
