use logferry_cloud::FerryError;
use logferry_cloud::metadata::MetadataServer;
use logferry_cloud::trust::IdentityProvider;
use pretty_assertions::assert_eq;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const IDENTITY_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/identity";
const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/log-writer";

#[tokio::test]
async fn identity_token_uses_audience_and_flavor_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(IDENTITY_PATH))
        .and(header("Metadata-Flavor", "Google"))
        .and(query_param("audience", ROLE_ARN))
        .and(query_param("format", "full"))
        .respond_with(ResponseTemplate::new(200).set_body_string("eyJhbGciOiJSUzI1NiJ9.payload.sig\n"))
        .mount(&server)
        .await;

    let metadata = MetadataServer::new(server.uri()).unwrap();
    let token = metadata.identity_token(ROLE_ARN).await.unwrap();

    assert_eq!(token, "eyJhbGciOiJSUzI1NiJ9.payload.sig");
}

#[tokio::test]
async fn works_through_identity_provider_trait() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(IDENTITY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("jwt"))
        .mount(&server)
        .await;

    let provider: Box<dyn IdentityProvider> = Box::new(MetadataServer::new(server.uri()).unwrap());
    assert_eq!(provider.identity_token(ROLE_ARN).await.unwrap(), "jwt");
}

#[tokio::test]
async fn empty_identity_token_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(IDENTITY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("  "))
        .mount(&server)
        .await;

    let err = MetadataServer::new(server.uri())
        .unwrap()
        .identity_token(ROLE_ARN)
        .await
        .unwrap_err();
    assert!(matches!(err, FerryError::TransientUnavailable(_)));
}

#[tokio::test]
async fn missing_service_account_is_auth_denied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(IDENTITY_PATH))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = MetadataServer::new(server.uri())
        .unwrap()
        .identity_token(ROLE_ARN)
        .await
        .unwrap_err();
    assert!(matches!(err, FerryError::AuthDenied(_)));
}

#[tokio::test]
async fn metadata_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(IDENTITY_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = MetadataServer::new(server.uri())
        .unwrap()
        .identity_token(ROLE_ARN)
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn unreachable_metadata_server_is_transient() {
    // Nothing listens on port 9 on loopback.
    let err = MetadataServer::new("http://127.0.0.1:9")
        .unwrap()
        .identity_token(ROLE_ARN)
        .await
        .unwrap_err();
    assert!(matches!(err, FerryError::TransientUnavailable(_)));
}

#[tokio::test]
async fn short_lived_access_token_is_refetched() {
    let server = MockServer::start().await;
    // Expires inside the refresh margin, so every call goes to the server.
    Mock::given(method("GET"))
        .and(path("/computeMetadata/v1/instance/service-accounts/default/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "ya29.short",
            "expires_in": 30
        })))
        .expect(2)
        .mount(&server)
        .await;

    let metadata = MetadataServer::new(server.uri()).unwrap();
    assert_eq!(metadata.access_token().await.unwrap(), "ya29.short");
    assert_eq!(metadata.access_token().await.unwrap(), "ya29.short");
}
