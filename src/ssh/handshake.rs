//! Connect and authentication flow
//!
//! The flow runs as one task on the session thread. Delegate callbacks
//! (host key trust, method selection, keyboard-interactive answers) are made
//! with the core released, so they can call `Session::authenticate_with_*`
//! which then executes inline.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::auth::{parse_allowed_methods, AuthDecision, AuthMethod, KbiRequest};
use super::core::{AuthState, Context, Notice, SessionCore};
use super::engine::{AuthAttempt, AuthReply, Handshake};
use super::error::SshError;
use super::host_key::HostKey;
use super::session::SessionStage;

/// Where an authentication attempt left the session
#[derive(Debug)]
pub(crate) enum AuthProgress {
    Authenticated,
    /// Keyboard-interactive needs another round of answers
    Prompt(KbiRequest),
}

impl SessionCore {
    fn start_connect(&mut self, deadline: Instant) -> Result<Handshake, SshError> {
        if self.stage != SessionStage::NotConnected {
            return Err(SshError::InvalidStage(format!(
                "connect requires a fresh session, session {} is {:?}",
                self.id, self.stage
            )));
        }
        if let Err(e) = self.options.validate() {
            warn!("Rejecting options for session {}: {}", self.id, e);
            return Err(self.fail(e));
        }

        self.set_stage(SessionStage::Connecting);
        info!(
            "Connecting to {}@{}:{} for session {}",
            self.target.username, self.target.host, self.target.port, self.id
        );

        let handshake = match self.engine.connect(
            &self.target,
            &self.options,
            deadline,
            self.notifier.clone(),
        ) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("Connect failed for session {}: {}", self.id, e);
                return Err(self.fail(e));
            }
        };
        if Instant::now() > deadline {
            return Err(self.fail(SshError::Timeout(format!(
                "Handshake with {}:{} did not finish in time",
                self.target.host, self.target.port
            ))));
        }

        {
            let mut snapshot = self.snapshot.write();
            snapshot.fd = handshake.fd;
            snapshot.server_banner = handshake.server_banner.clone();
            snapshot.negotiated = handshake.negotiated.clone();
        }
        if let Some(banner) = &handshake.server_banner {
            self.outbox.push_back(Notice::ServerBanner(banner.clone()));
        }
        self.outbox
            .push_back(Notice::Negotiated(handshake.negotiated.clone()));
        Ok(handshake)
    }

    /// One engine authentication call. Events the engine reported meanwhile
    /// (userauth banners) are taken in before the reply is acted on.
    fn engine_authenticate(&mut self, attempt: AuthAttempt<'_>) -> Result<AuthReply, SshError> {
        let username = self.target.username.clone();
        let reply = self.engine.authenticate(&username, attempt);
        for event in self.engine.poll_events(Duration::ZERO) {
            self.handle_event(event);
        }
        if !self.stage.has_transport() {
            return Err(self
                .snapshot
                .read()
                .last_error
                .clone()
                .unwrap_or(SshError::Disconnected));
        }
        reply
    }

    /// Ask for the "none" method. Returns true when that alone was enough.
    fn begin_auth(&mut self) -> Result<bool, SshError> {
        if self.stage != SessionStage::Connecting {
            return Err(self
                .snapshot
                .read()
                .last_error
                .clone()
                .unwrap_or(SshError::Disconnected));
        }
        self.set_stage(SessionStage::PreAuthenticate);
        match self.engine_authenticate(AuthAttempt::None) {
            Ok(AuthReply::Success) => {
                self.mark_authenticated();
                Ok(true)
            }
            Ok(AuthReply::Failure {
                methods,
                partial_success,
            }) => {
                info!(
                    "Server allows [{}] for session {}",
                    methods.join(","),
                    self.id
                );
                self.auth = AuthState {
                    allowed: methods,
                    partial_success,
                    rounds: 0,
                };
                self.set_stage(SessionStage::Authenticating);
                Ok(false)
            }
            Ok(AuthReply::InfoRequest(_)) => Err(self.fail(SshError::ProtocolError(
                "Unexpected keyboard-interactive prompt for none".to_string(),
            ))),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn next_auth_round(&mut self) -> Result<(Vec<AuthMethod>, bool), SshError> {
        if self.stage != SessionStage::Authenticating {
            return Err(SshError::InvalidStage(format!(
                "Session {} is not authenticating ({:?})",
                self.id, self.stage
            )));
        }
        self.auth.rounds += 1;
        if self.auth.rounds > self.options.max_auth_attempts {
            return Err(self.fail(SshError::RequestDenied(format!(
                "Gave up after {} authentication attempts",
                self.options.max_auth_attempts
            ))));
        }
        match parse_allowed_methods(&self.auth.allowed) {
            Ok(methods) => Ok((methods, self.auth.partial_success)),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Drive one authentication request.
    ///
    /// Rejection leaves the session authenticating with an updated method
    /// list; trying a method the server did not offer ends the session.
    pub(crate) fn attempt_auth(
        &mut self,
        method: AuthMethod,
        attempt: AuthAttempt<'_>,
    ) -> Result<AuthProgress, SshError> {
        if self.stage != SessionStage::Authenticating {
            return Err(SshError::InvalidStage(format!(
                "Session {} is not authenticating ({:?})",
                self.id, self.stage
            )));
        }
        let continuing = matches!(attempt, AuthAttempt::KeyboardInteractiveRespond(_));
        if !continuing && !self.auth.allowed.iter().any(|m| m == method.name()) {
            return Err(self.fail(SshError::RequestDenied(format!(
                "{} is not among the allowed methods [{}]",
                method,
                self.auth.allowed.join(",")
            ))));
        }

        match self.engine_authenticate(attempt) {
            Ok(AuthReply::Success) => {
                self.mark_authenticated();
                Ok(AuthProgress::Authenticated)
            }
            Ok(AuthReply::Failure {
                methods,
                partial_success,
            }) => {
                info!(
                    "{} rejected for session {}, server allows [{}]",
                    method,
                    self.id,
                    methods.join(",")
                );
                self.auth.allowed = methods;
                self.auth.partial_success = partial_success;
                Err(SshError::RequestDenied(format!(
                    "{} authentication rejected",
                    method
                )))
            }
            Ok(AuthReply::InfoRequest(request)) if method == AuthMethod::KeyboardInteractive => {
                Ok(AuthProgress::Prompt(request))
            }
            Ok(AuthReply::InfoRequest(_)) => Err(self.fail(SshError::ProtocolError(format!(
                "Unexpected keyboard-interactive prompt during {}",
                method
            )))),
            Err(e) if e.is_transport_fatal() => Err(self.fail(e)),
            Err(e) => Err(e),
        }
    }

    fn mark_authenticated(&mut self) {
        info!(
            "Authenticated {} on session {}",
            self.target.username, self.id
        );
        self.set_stage(SessionStage::Authenticated);
        self.outbox.push_back(Notice::Authenticated);
    }
}

impl Context {
    pub(crate) fn connect(&self, timeout: Duration) -> Result<(), SshError> {
        let deadline = Instant::now() + timeout;
        let handshake = self.with_core(|core| core.start_connect(deadline))?;

        if !self.trust_host_key(&handshake.host_key) {
            let error = SshError::HostKeyRejected(format!(
                "{} key {}",
                handshake.host_key.key_type(),
                handshake.host_key.fingerprint()
            ));
            return Err(self.with_core(|core| core.fail(error)));
        }

        if self.with_core(|core| core.begin_auth())? {
            return Ok(());
        }
        self.run_auth_rounds()
    }

    fn trust_host_key(&self, host_key: &HostKey) -> bool {
        match self.session_and_delegate() {
            Some((session, delegate)) => delegate.should_trust_host_key(&session, host_key),
            None => false,
        }
    }

    fn run_auth_rounds(&self) -> Result<(), SshError> {
        loop {
            let (methods, partial_success) = self.with_core(|core| core.next_auth_round())?;
            let decision = match self.session_and_delegate() {
                Some((session, delegate)) => {
                    delegate.authenticate(&session, &methods, partial_success)
                }
                None => AuthDecision::Unsupported,
            };

            match self.stage() {
                SessionStage::Authenticated => return Ok(()),
                SessionStage::Authenticating => {}
                _ => return Err(self.last_error().unwrap_or(SshError::Disconnected)),
            }
            match decision {
                AuthDecision::Handled => {}
                AuthDecision::Unsupported => {
                    let error = SshError::RequestDenied(
                        "No usable authentication method".to_string(),
                    );
                    return Err(self.with_core(|core| core.fail(error)));
                }
                AuthDecision::Failed(error) => {
                    return Err(self.with_core(|core| core.fail(error)));
                }
            }
        }
    }

    pub(crate) fn authenticate_keyboard_interactive(&self) -> Result<(), SshError> {
        let mut progress = self.with_core(|core| {
            core.attempt_auth(
                AuthMethod::KeyboardInteractive,
                AuthAttempt::KeyboardInteractiveStart,
            )
        })?;
        loop {
            let request = match progress {
                AuthProgress::Authenticated => return Ok(()),
                AuthProgress::Prompt(request) => request,
            };
            let responses = self
                .session_and_delegate()
                .and_then(|(session, delegate)| delegate.keyboard_interactive(&session, &request));
            let Some(responses) = responses else {
                return Err(SshError::RequestDenied(
                    "Keyboard-interactive authentication cancelled".to_string(),
                ));
            };
            progress = self.with_core(|core| {
                core.attempt_auth(
                    AuthMethod::KeyboardInteractive,
                    AuthAttempt::KeyboardInteractiveRespond(responses),
                )
            })?;
        }
    }
}
