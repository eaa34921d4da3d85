/// hydllp protocol client.
///
/// The native library exposes four entry points: StartUpEx (login),
/// ShutDown (logout), JsonCall (one request into a caller-sized buffer)
/// and DecodeError. `Transport` is the seam over those entry points; the
/// binding to the library itself lives with whoever loads it (it is 32-bit
/// Windows only), and the web service provides a second implementation.
///
/// `Hydllp` adds the protocol rules on top:
/// - a call whose answer does not fit is retried once with the buffer
///   size the server asked for;
/// - any other non-zero `error_num` is a `HydstraError::Protocol`;
/// - calls outside a login are refused.

use std::path::Path;

use serde_json::Value;

use crate::config::HydllpConfig;
use crate::logging::{self, Channel};
use crate::model::HydstraError;
use crate::rpc::protocol::{ResponseEnvelope, RpcRequest, RpcReturn, BUFFER_TOO_SMALL};
use crate::rpc::{RpcClient, SessionScope};

/// Entry points of the Hydstra server library.
pub trait Transport {
    /// StartUpEx. Returns the library's status code (0 = success).
    fn start_up(
        &mut self,
        username: &str,
        password: &str,
        hyaccess: &Path,
        hyconfig: &Path,
    ) -> Result<i32, HydstraError>;

    /// ShutDown. Returns the library's status code (0 = success).
    fn shut_down(&mut self) -> Result<i32, HydstraError>;

    /// JsonCall. Returns the response text written into a buffer of
    /// `buffer_len` bytes.
    fn json_call(&mut self, request: &str, buffer_len: usize) -> Result<String, HydstraError>;

    /// DecodeError: human-readable text for a status code.
    fn decode_error(&mut self, code: i32) -> String;

    /// Log channel for this transport.
    fn channel(&self) -> Channel {
        Channel::Hydllp
    }
}

/// Protocol client over a `Transport`.
pub struct Hydllp<T: Transport> {
    transport: T,
    config: HydllpConfig,
    logged_in: bool,
}

impl<T: Transport> Hydllp<T> {
    pub fn new(transport: T, config: HydllpConfig) -> Self {
        Self {
            transport,
            config,
            logged_in: false,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Logs in with the configured credentials and ini files.
    pub fn login(&mut self) -> Result<(), HydstraError> {
        if self.logged_in {
            return Ok(());
        }
        let code = self.transport.start_up(
            &self.config.username,
            &self.config.password,
            &self.config.hyaccess_path(),
            &self.config.hyconfig_path(),
        )?;
        if code != 0 {
            let message = self.transport.decode_error(code);
            return Err(HydstraError::Login(format!("StartUpEx {}: {}", code, message)));
        }
        self.logged_in = true;
        logging::debug(self.transport.channel(), None, "session opened");
        Ok(())
    }

    /// Logs out. A no-op when not logged in.
    pub fn logout(&mut self) -> Result<(), HydstraError> {
        if !self.logged_in {
            return Ok(());
        }
        // Whatever ShutDown says, the handle is unusable afterwards.
        self.logged_in = false;
        let code = self.transport.shut_down()?;
        if code != 0 {
            let message = self.transport.decode_error(code);
            return Err(HydstraError::Login(format!("ShutDown {}: {}", code, message)));
        }
        logging::debug(self.transport.channel(), None, "session closed");
        Ok(())
    }

    /// Sends `request` and returns the raw `return` payload.
    pub fn query(&mut self, request: &RpcRequest) -> Result<Value, HydstraError> {
        if !self.logged_in {
            return Err(HydstraError::Login(format!(
                "{} called outside a session",
                request.function()
            )));
        }
        let body = request.to_json()?;

        let mut buffer_len = self.config.initial_buffer_len;
        let mut envelope = ResponseEnvelope::parse(&self.transport.json_call(&body, buffer_len)?)?;

        if envelope.error_num == BUFFER_TOO_SMALL {
            let required = envelope.buffer_required().ok_or_else(|| HydstraError::Protocol {
                code: BUFFER_TOO_SMALL,
                message: "buffer too small but no buff_required given".to_string(),
            })?;
            logging::debug(
                self.transport.channel(),
                None,
                &format!(
                    "{}: resizing buffer {} -> {}",
                    request.function(),
                    buffer_len,
                    required
                ),
            );
            buffer_len = required;
            envelope = ResponseEnvelope::parse(&self.transport.json_call(&body, buffer_len)?)?;
        }

        envelope.into_payload()
    }
}

impl<T: Transport> RpcClient for Hydllp<T> {
    fn call(&mut self, request: &RpcRequest) -> Result<RpcReturn, HydstraError> {
        let payload = self.query(request)?;
        RpcReturn::decode(request, payload)
    }
}

impl<T: Transport> SessionScope for Hydllp<T> {
    fn acquire(&mut self) -> Result<(), HydstraError> {
        self.login()
    }

    fn release(&mut self) -> Result<(), HydstraError> {
        self.logout()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Session;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    /// Replays canned JsonCall answers and records what was sent.
    #[derive(Default)]
    struct ScriptedTransport {
        answers: VecDeque<String>,
        calls: Vec<(String, usize)>,
        start_up_code: i32,
        shut_down_code: i32,
        shut_downs: usize,
    }

    impl ScriptedTransport {
        fn answering(answers: &[&str]) -> Self {
            Self {
                answers: answers.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn start_up(
            &mut self,
            _username: &str,
            _password: &str,
            _hyaccess: &Path,
            _hyconfig: &Path,
        ) -> Result<i32, HydstraError> {
            Ok(self.start_up_code)
        }

        fn shut_down(&mut self) -> Result<i32, HydstraError> {
            self.shut_downs += 1;
            Ok(self.shut_down_code)
        }

        fn json_call(&mut self, request: &str, buffer_len: usize) -> Result<String, HydstraError> {
            self.calls.push((request.to_string(), buffer_len));
            self.answers
                .pop_front()
                .ok_or_else(|| HydstraError::Transport("no scripted answer left".into()))
        }

        fn decode_error(&mut self, code: i32) -> String {
            format!("decoded {}", code)
        }
    }

    fn config() -> HydllpConfig {
        HydllpConfig {
            ini_path: PathBuf::from("/opt/hyd"),
            dll_path: PathBuf::from("/opt/hyd/sys/run"),
            hydllp_filename: "hydllp.dll".to_string(),
            hyaccess_filename: "Hyaccess.ini".to_string(),
            hyconfig_filename: "HYCONFIG.INI".to_string(),
            username: String::new(),
            password: String::new(),
            initial_buffer_len: 1400,
        }
    }

    fn site_list_request() -> RpcRequest {
        RpcRequest::SiteList {
            expression: "TSFILES(DSOURCES(A))".to_string(),
        }
    }

    #[test]
    fn test_small_buffer_is_resized_and_retried_once() {
        let transport = ScriptedTransport::answering(&[
            r#"{"error_num": 200, "buff_required": 52000}"#,
            r#"{"error_num": 0, "return": {"sites": ["70105", "69607"]}}"#,
        ]);
        let mut hyd = Hydllp::new(transport, config());
        hyd.login().unwrap();

        let sites = hyd.get_site_list("TSFILES(DSOURCES(A))").unwrap();
        assert_eq!(sites, vec!["70105", "69607"]);

        let calls = &hyd.transport().calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, 1400);
        assert_eq!(calls[1].1, 52000);
        assert_eq!(calls[0].0, calls[1].0, "retry must resend the identical request");
    }

    #[test]
    fn test_second_buffer_error_is_not_retried_again() {
        let transport = ScriptedTransport::answering(&[
            r#"{"error_num": 200, "buff_required": 2000}"#,
            r#"{"error_num": 200, "buff_required": 4000}"#,
        ]);
        let mut hyd = Hydllp::new(transport, config());
        hyd.login().unwrap();
        let result = hyd.query(&site_list_request());
        assert!(matches!(result, Err(HydstraError::Protocol { code: 200, .. })));
        assert_eq!(hyd.transport().calls.len(), 2);
    }

    #[test]
    fn test_nonzero_error_num_is_protocol_error() {
        let transport = ScriptedTransport::answering(&[
            r#"{"error_num": 127, "error_msg": "Invalid site list"}"#,
        ]);
        let mut hyd = Hydllp::new(transport, config());
        hyd.login().unwrap();
        assert_eq!(
            hyd.query(&site_list_request()),
            Err(HydstraError::Protocol {
                code: 127,
                message: "Invalid site list".to_string()
            })
        );
    }

    #[test]
    fn test_call_outside_session_is_refused() {
        let mut hyd = Hydllp::new(ScriptedTransport::default(), config());
        assert!(matches!(
            hyd.query(&site_list_request()),
            Err(HydstraError::Login(_))
        ));
        assert!(hyd.transport().calls.is_empty());
    }

    #[test]
    fn test_failed_start_up_decodes_error() {
        let transport = ScriptedTransport {
            start_up_code: 3,
            ..Default::default()
        };
        let mut hyd = Hydllp::new(transport, config());
        assert_eq!(
            hyd.login(),
            Err(HydstraError::Login("StartUpEx 3: decoded 3".to_string()))
        );
        assert!(!hyd.is_logged_in());
    }

    #[test]
    fn test_logout_is_idempotent() {
        let mut hyd = Hydllp::new(ScriptedTransport::default(), config());
        hyd.login().unwrap();
        hyd.logout().unwrap();
        hyd.logout().unwrap();
        assert_eq!(hyd.transport().shut_downs, 1);
    }

    #[test]
    fn test_session_logs_out_after_protocol_error() {
        let transport = ScriptedTransport::answering(&[r#"{"error_num": 5, "error_msg": "x"}"#]);
        let mut hyd = Hydllp::new(transport, config());
        let outcome = (|| -> Result<Vec<String>, HydstraError> {
            let mut session = Session::open(&mut hyd)?;
            let sites = session.get_site_list("ALL")?;
            session.close()?;
            Ok(sites)
        })();
        assert!(outcome.is_err());
        assert!(!hyd.is_logged_in());
        assert_eq!(hyd.transport().shut_downs, 1);
    }
}
