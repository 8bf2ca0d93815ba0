// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Signing in to the stream provider through its regular login form.

use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::time::{sleep, Instant};

use super::page::PageDriver;
use super::scripts;
use super::{PlayerError, PlayerTimings};
use crate::config::{Credentials, LoginConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    /// The page left the login form after submitting.
    LeftLoginPage,
    StillOnLoginPage,
    FieldsNotFound,
    NoCredentials,
    Failed,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Center {
    x: i64,
    y: i64,
}

async fn evaluate_bool(page: &dyn PageDriver, script: &str) -> Result<bool, PlayerError> {
    Ok(page.evaluate(script).await?.as_bool().unwrap_or(false))
}

/// Whether the current page asks for a login. Evaluation failures count as "no".
pub async fn is_login_page(page: &dyn PageDriver) -> bool {
    evaluate_bool(page, scripts::IS_LOGIN_PAGE).await.unwrap_or(false)
}

async fn fill_first(page: &dyn PageDriver, selectors: &[&str], text: &str) -> Result<bool, PlayerError> {
    let matched = page.evaluate(&scripts::focus_first(selectors)).await?;
    match matched.as_str() {
        Some(selector) => {
            page.insert_text(text).await?;
            debug!("Filled {}", selector);
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn wait_for_clickable(page: &dyn PageDriver, selector: &str, timeout: Duration) -> Option<Center> {
    let script = scripts::clickable_center(selector);
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(value) = page.evaluate(&script).await {
            if let Ok(center) = serde_json::from_value::<Center>(value) {
                return Some(center);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

/// Tries every submit selector, waiting for each to become clickable, for up to the configured attempts.
async fn click_submit(page: &dyn PageDriver, timings: &PlayerTimings) -> Result<bool, PlayerError> {
    for attempt in 1..=timings.submit_attempts {
        let wait = if attempt == 1 { timings.submit_first_wait() } else { timings.submit_retry_wait() };
        for selector in scripts::SUBMIT_SELECTORS {
            if let Some(center) = wait_for_clickable(page, selector, wait).await {
                page.click(center.x, center.y).await?;
                debug!("Clicked submit {} on attempt {}", selector, attempt);
                return Ok(true);
            }
        }
        if attempt < timings.submit_attempts {
            let backoff = timings.submit_backoff() * attempt;
            debug!("No clickable submit button, retrying in {:?}", backoff);
            sleep(backoff).await;
        }
    }
    Ok(false)
}

async fn run(
    page: &dyn PageDriver,
    credentials: &Credentials,
    login: &LoginConfig,
    timings: &PlayerTimings,
) -> Result<LoginOutcome, PlayerError> {
    if !evaluate_bool(page, scripts::HAS_LOGIN_FORM).await? {
        info!("Navigating to login page {}", login.url);
        page.navigate(&login.url, timings.login_navigation_timeout()).await?;
    }
    sleep(timings.login_settle()).await;

    if evaluate_bool(page, scripts::ACCEPT_COOKIES).await.unwrap_or(false) {
        debug!("Accepted cookie banner");
        sleep(timings.consent_settle()).await;
    }

    let email = fill_first(page, scripts::EMAIL_SELECTORS, &credentials.email).await?;
    let password = fill_first(page, scripts::PASSWORD_SELECTORS, &credentials.password).await?;
    if !email || !password {
        warn!("Login form incomplete (email field: {}, password field: {})", email, password);
        return Ok(LoginOutcome::FieldsNotFound);
    }
    sleep(timings.post_fill_settle()).await;

    let mut submitted = click_submit(page, timings).await?;
    if !submitted {
        submitted = evaluate_bool(page, scripts::SUBMIT_FORM).await.unwrap_or(false);
        if submitted {
            debug!("Submitted login form directly");
        }
    }
    if !submitted {
        debug!("No submit control found, pressing Enter");
        page.press_enter().await?;
    }

    let navigated = page.wait_for_navigation(timings.post_submit_wait()).await.unwrap_or(false);
    debug!("After login attempt (navigated: {}): {}", navigated, page.url().await.unwrap_or_default());

    if evaluate_bool(page, scripts::STILL_ON_LOGIN).await.unwrap_or(true) {
        warn!("Still on the login page, login may have failed");
        Ok(LoginOutcome::StillOnLoginPage)
    } else {
        info!("Login appears successful");
        Ok(LoginOutcome::LeftLoginPage)
    }
}

/// Runs the whole login sequence. Never fails; problems are logged and reported in the outcome.
pub async fn log_in(
    page: &dyn PageDriver,
    credentials: Option<&Credentials>,
    login: &LoginConfig,
    timings: &PlayerTimings,
) -> LoginOutcome {
    let Some(credentials) = credentials else {
        warn!("No credentials available, skipping login");
        return LoginOutcome::NoCredentials;
    };
    info!("Starting login");
    match run(page, credentials, login, timings).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Login error: {}", e);
            LoginOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::fake::{FakePage, SUBMIT_CENTER};
    use std::sync::atomic::Ordering;

    fn credentials() -> Credentials {
        Credentials { email: "ops@example.com".into(), password: "hunter2".into() }
    }

    fn login_config() -> LoginConfig {
        LoginConfig { url: "https://example.com/login".into() }
    }

    fn login_form() -> FakePage {
        let page = FakePage::new(1920);
        page.login_page.store(true, Ordering::SeqCst);
        page
    }

    #[tokio::test]
    async fn missing_credentials_skip_login() {
        let page = login_form();
        let outcome = log_in(&page, None, &login_config(), &PlayerTimings::immediate()).await;
        assert_eq!(outcome, LoginOutcome::NoCredentials);
        assert!(page.typed().is_empty());
    }

    #[tokio::test]
    async fn submit_button_is_clicked() {
        let page = login_form();
        page.submit_visible.store(true, Ordering::SeqCst);
        let outcome = log_in(&page, Some(&credentials()), &login_config(), &PlayerTimings::immediate()).await;

        assert_eq!(outcome, LoginOutcome::LeftLoginPage);
        assert_eq!(page.typed(), vec!["ops@example.com", "hunter2"]);
        assert_eq!(page.clicks(), vec![SUBMIT_CENTER]);
        assert!(page.navigations().is_empty());
    }

    #[tokio::test]
    async fn enter_is_pressed_when_no_submit_control_appears() {
        let page = login_form();
        let outcome = log_in(&page, Some(&credentials()), &login_config(), &PlayerTimings::immediate()).await;

        assert_eq!(outcome, LoginOutcome::LeftLoginPage);
        assert!(page.clicks().is_empty());
        assert_eq!(page.enter_presses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_login_is_reported() {
        let page = login_form();
        page.submit_visible.store(true, Ordering::SeqCst);
        page.accepts_login.store(false, Ordering::SeqCst);
        let outcome = log_in(&page, Some(&credentials()), &login_config(), &PlayerTimings::immediate()).await;
        assert_eq!(outcome, LoginOutcome::StillOnLoginPage);
    }

    #[tokio::test]
    async fn page_without_form_goes_to_login_url() {
        let page = FakePage::new(1920);
        let outcome = log_in(&page, Some(&credentials()), &login_config(), &PlayerTimings::immediate()).await;

        assert_eq!(outcome, LoginOutcome::FieldsNotFound);
        assert_eq!(page.navigations(), vec!["https://example.com/login"]);
    }
}
