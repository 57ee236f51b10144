//! Detection of anti-automation interstitials and the wait-for-clearance loop.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;
use crate::traits::PageSession;

/// Markers that identify captcha widgets, challenge scripts and block pages.
pub const DEFAULT_MARKERS: &[&str] = &[
    "g-recaptcha",
    "h-captcha",
    "hcaptcha.com",
    "cf-challenge",
    "challenge-platform",
    "cf-turnstile",
    "px-captcha",
    "verify you are human",
    "are you a robot",
    "unusual traffic",
    "checking your browser",
    // Block pages title themselves this way; body text alone is too common.
    "<title>access denied",
];

/// Case-insensitive substring matcher over page content.
#[derive(Debug, Clone)]
pub struct ChallengeDetector {
    markers: Vec<String>,
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MARKERS.iter().copied())
    }
}

impl ChallengeDetector {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.as_ref().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn with_marker(mut self, marker: impl AsRef<str>) -> Self {
        self.markers.push(marker.as_ref().to_lowercase());
        self
    }

    /// The first marker found in `html`, if any.
    pub fn detect(&self, html: &str) -> Option<&str> {
        let haystack = html.to_lowercase();
        self.markers
            .iter()
            .find(|m| haystack.contains(m.as_str()))
            .map(String::as_str)
    }

    /// Return `html` unchanged if it is clean; otherwise refresh `session`
    /// every `poll_interval` until the challenge clears or `timeout` passes.
    pub async fn wait_for_clearance<S: PageSession>(
        &self,
        session: &S,
        html: String,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<String, AppError> {
        let Some(marker) = self.detect(&html) else {
            return Ok(html);
        };
        let marker = marker.to_string();
        tracing::warn!(%marker, timeout_secs = timeout.as_secs(), "Challenge detected, waiting for clearance");

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::Challenge(format!(
                    "'{marker}' still present after {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;

            let html = session.refresh().await?;
            if self.detect(&html).is_none() {
                tracing::info!(%marker, "Challenge cleared");
                return Ok(html);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockSession;

    #[test]
    fn test_detects_known_markers() {
        let detector = ChallengeDetector::default();
        assert_eq!(
            detector.detect(r#"<div class="g-recaptcha" data-sitekey="x"></div>"#),
            Some("g-recaptcha")
        );
        assert_eq!(
            detector.detect("<h1>Please VERIFY YOU ARE HUMAN</h1>"),
            Some("verify you are human")
        );
        assert_eq!(detector.detect("<h1>Senior Rust Engineer</h1>"), None);
    }

    #[test]
    fn test_access_denied_needs_block_page_title() {
        let detector = ChallengeDetector::default();
        assert_eq!(
            detector.detect("<html><head><TITLE>Access Denied</TITLE></head></html>"),
            Some("<title>access denied")
        );
        assert_eq!(
            detector.detect("<h1>IAM Engineer</h1><p>Debug access denied errors across teams.</p>"),
            None
        );
    }

    #[test]
    fn test_custom_marker() {
        let detector = ChallengeDetector::new(["bot-wall"]).with_marker("Blocked");
        assert_eq!(detector.detect("<p>blocked</p>"), Some("blocked"));
        assert_eq!(detector.detect("<div id=bot-wall>"), Some("bot-wall"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_page_passes_through() {
        let session = MockSession::new(vec![]);
        let html = ChallengeDetector::default()
            .wait_for_clearance(&session, "<p>ok</p>".into(), Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(html, "<p>ok</p>");
        assert_eq!(session.refresh_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_clears_after_refresh() {
        let session = MockSession::new(vec![
            Ok("<div class=cf-challenge></div>".into()),
            Ok("<p>job</p>".into()),
        ]);
        let html = ChallengeDetector::default()
            .wait_for_clearance(
                &session,
                "<div class=cf-challenge></div>".into(),
                Duration::from_secs(60),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(html, "<p>job</p>");
        assert_eq!(session.refresh_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_challenge_times_out() {
        let session = MockSession::new(vec![]).with_default("<div class=px-captcha></div>");
        let start = Instant::now();
        let err = ChallengeDetector::default()
            .wait_for_clearance(
                &session,
                "<div class=px-captcha></div>".into(),
                Duration::from_secs(10),
                Duration::from_secs(3),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Challenge(_)));
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(session.refresh_count(), 4);
    }
}
