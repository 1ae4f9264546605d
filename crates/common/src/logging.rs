use crate::config::Profile;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// Filtering comes from `RUST_LOG` (default "info"). A development profile
/// gets human-oriented pretty output; production gets one JSON object per
/// line for log shippers.
pub fn setup_logging(profile: Profile) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if profile.is_production() {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().pretty().with_target(false))
            .init();
    }
}
