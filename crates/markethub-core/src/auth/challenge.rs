//! Interactive verification challenges (captcha-style widgets) that some
//! sign-in flows require before the identity provider will issue a token.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::identity::IdentityError;

/// A verification widget with an explicit lifecycle.
///
/// The owner calls `create` once, `solve` at most once, and `dispose` exactly
/// once afterwards whatever the outcome.
#[async_trait]
pub trait ChallengeWidget: Send {
    async fn create(&mut self) -> Result<(), IdentityError>;

    /// Returns the verification proof to hand to the identity provider.
    async fn solve(&mut self) -> Result<String, IdentityError>;

    fn dispose(&mut self);
}

/// Run a widget through create, solve and dispose.
pub async fn solve_challenge<W>(widget: &mut W) -> Result<String, IdentityError>
where
    W: ChallengeWidget + ?Sized,
{
    let result = match widget.create().await {
        Ok(()) => widget.solve().await,
        Err(e) => Err(e),
    };

    widget.dispose();
    match result {
        Ok(proof) => {
            debug!("Challenge solved");
            Ok(proof)
        }
        Err(e) => {
            warn!(error = %e, "Challenge failed");
            Err(e)
        }
    }
}
