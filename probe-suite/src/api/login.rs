use probe::{check, eyre, session};
use tracing::info;

/// Logs in with the configured test identity. The token is kept for the other API tests.
#[probe::test]
async fn test_login_api() -> eyre::Result<()> {
    let token = session::token().await?;
    check!(!token.as_str().is_empty(), "authentication token is empty");
    info!("login api test completed");
    Ok(())
}
