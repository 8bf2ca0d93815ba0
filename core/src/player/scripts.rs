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

//! Page-side JavaScript used to inspect the player and login pages.

use serde::Deserialize;

pub const EMAIL_SELECTORS: &[&str] = &[
    r#"input[type="email"]"#,
    r#"input[name="email"]"#,
    r#"input[name*="email" i]"#,
    "#email",
];

pub const PASSWORD_SELECTORS: &[&str] = &[
    r#"input[type="password"]"#,
    r#"input[name="password"]"#,
    r#"input[name*="password" i]"#,
    "#password",
];

pub const SUBMIT_SELECTORS: &[&str] = &[
    r#"button[type="submit"]"#,
    r#"input[type="submit"]"#,
    r#"button[name="login"]"#,
    r#"button[name="signin"]"#,
    r#"[data-testid*="login" i]"#,
];

/// Login form fields, a login form action or a login-looking URL.
pub const IS_LOGIN_PAGE: &str = r#"(() => {
  const path = (window.location.pathname || '').toLowerCase();
  const url = (window.location.href || '').toLowerCase();
  const hasEmail = !!document.querySelector('input[type="email"], input[name*="email" i], #email, input[id*="username" i]');
  const hasPassword = !!document.querySelector('input[type="password"], input[name*="password" i], #password');
  const hasAuthForm = !!document.querySelector('form[action*="login" i], form[action*="signin" i]');
  const loginMarkers = /login|signin|sign-in|authenticate/.test(path) || /login|signin/.test(url);
  return (hasEmail && hasPassword) || hasAuthForm || loginMarkers;
})()"#;

/// Narrower check used before deciding to navigate to the login URL.
pub const HAS_LOGIN_FORM: &str = r#"(() => {
  const hasEmail = !!document.querySelector('input[type="email"], input[name*="email" i], #email');
  const hasPassword = !!document.querySelector('input[type="password"], input[name*="password" i], #password');
  const path = window.location.pathname.toLowerCase();
  return (hasEmail && hasPassword) || path.includes('login') || path.includes('signin');
})()"#;

pub const STILL_ON_LOGIN: &str = r#"(() => {
  const path = window.location.pathname.toLowerCase();
  return path.includes('login') || path.includes('signin') || !!document.querySelector('input[type="password"]');
})()"#;

pub const ACCEPT_COOKIES: &str = r#"(() => {
  const matches = ['accept', 'agree', 'consent', 'allow'];
  const candidates = Array.from(document.querySelectorAll('button, [role="button"], input[type="button"], input[type="submit"]'));
  for (const el of candidates) {
    const text = (el.innerText || el.value || '').toLowerCase();
    if (matches.some(m => text.includes(m))) { el.click(); return true; }
  }
  for (const sel of ['#onetrust-accept-btn-handler', '.onetrust-accept-btn-handler', '#consent-accept', '.cookie-accept']) {
    const el = document.querySelector(sel);
    if (el) { el.click(); return true; }
  }
  return false;
})()"#;

pub const SUBMIT_FORM: &str = r#"(() => {
  const form = document.querySelector('form');
  if (form && form.checkValidity()) { form.submit(); return true; }
  const button = form && form.querySelector('button[type="submit"], input[type="submit"]');
  if (button && !button.disabled) { button.click(); return true; }
  return false;
})()"#;

pub const PLAYER_SURFACE_PRESENT: &str =
    "!!(document.querySelector('.veo-player-container') || document.querySelector('veo-player') || document.querySelector('video'))";

pub const PLAYER_READY: &str = r#"(() => {
  const v = document.querySelector('video');
  return !!(v && v.readyState >= 3 && v.duration > 0);
})()"#;

pub const VIDEO_STATE: &str = r#"(() => {
  const v = document.querySelector('video');
  if (!v) return null;
  return { paused: v.paused, ended: v.ended, readyState: v.readyState, currentTime: v.currentTime };
})()"#;

pub const VIEWPORT_WIDTH: &str = "window.innerWidth";

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoState {
    pub paused: bool,
    pub ended: bool,
    pub ready_state: u8,
    pub current_time: f64,
}

impl VideoState {
    pub fn is_playing(&self) -> bool {
        self.current_time > 0.0 && !self.paused && !self.ended && self.ready_state >= 3
    }
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Focuses and clears the first element matching any of `selectors`; yields the matching selector or `null`.
pub fn focus_first(selectors: &[&str]) -> String {
    let list: Vec<String> = selectors.iter().map(|s| js_string(s)).collect();
    format!(
        r#"(() => {{
  for (const sel of [{}]) {{
    const el = document.querySelector(sel);
    if (el) {{ el.focus(); el.value = ''; return sel; }}
  }}
  return null;
}})()"#,
        list.join(", ")
    )
}

/// Centre of `selector` when it is visible and enabled, otherwise `null`.
pub fn clickable_center(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({});
  if (!el || el.offsetParent === null || el.disabled) return null;
  if (window.getComputedStyle(el).visibility === 'hidden') return null;
  if (el.type === 'submit' && el.form && el.form.checkValidity() === false) return null;
  const r = el.getBoundingClientRect();
  return {{ x: Math.round(r.left + r.width / 2), y: Math.round(r.top + r.height / 2) }};
}})()"#,
        js_string(selector)
    )
}

/// Short-lived marker drawn where an emulated click lands.
pub fn click_overlay(x: i64, y: i64, label: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.createElement('div');
  el.style.cssText = 'position:fixed;left:{left}px;top:{top}px;width:24px;height:24px;border:3px solid rgba(255,0,0,0.9);border-radius:50%;background:rgba(255,0,0,0.15);z-index:2147483647;pointer-events:none;transition:opacity 0.4s ease';
  const tag = document.createElement('div');
  tag.textContent = {label};
  tag.style.cssText = 'position:absolute;top:26px;left:-6px;font:bold 10px sans-serif;color:red;background:rgba(255,255,255,0.6);padding:1px 3px';
  el.appendChild(tag);
  document.body.appendChild(el);
  setTimeout(() => {{ el.style.opacity = '0'; setTimeout(() => el.remove(), 450); }}, 350);
  return true;
}})()"#,
        left = x - 12,
        top = y - 12,
        label = js_string(label)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_state_playing_needs_progress_and_data() {
        let playing = VideoState { paused: false, ended: false, ready_state: 4, current_time: 12.5 };
        assert!(playing.is_playing());
        assert!(!VideoState { current_time: 0.0, ..playing }.is_playing());
        assert!(!VideoState { paused: true, ..playing }.is_playing());
        assert!(!VideoState { ready_state: 2, ..playing }.is_playing());
    }

    #[test]
    fn selectors_are_quoted_for_javascript() {
        let script = focus_first(&[r#"input[type="email"]"#]);
        assert!(script.contains(r#""input[type=\"email\"]""#));
    }

    #[test]
    fn video_state_parses_from_page_json() {
        let state: VideoState =
            serde_json::from_value(serde_json::json!({"paused": false, "ended": false, "readyState": 4, "currentTime": 3.2}))
                .unwrap();
        assert!(state.is_playing());
    }
}
