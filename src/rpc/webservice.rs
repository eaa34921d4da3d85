/// Hydstra web service transport.
///
/// The web service (`cgi/webservice.exe`) accepts the same JSON calls as
/// JsonCall, one per HTTP POST, and answers with the same envelope. It is
/// stateless: there is no login handshake and the response is never
/// truncated, so the buffer size is ignored.

use std::path::Path;
use std::time::Duration;

use crate::config::WebServiceConfig;
use crate::logging::Channel;
use crate::model::HydstraError;
use crate::rpc::hydllp::Transport;

pub struct WebServiceTransport {
    client: reqwest::blocking::Client,
    url: String,
}

impl WebServiceTransport {
    pub fn new(config: &WebServiceConfig) -> Result<Self, HydstraError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

impl Transport for WebServiceTransport {
    fn start_up(
        &mut self,
        _username: &str,
        _password: &str,
        _hyaccess: &Path,
        _hyconfig: &Path,
    ) -> Result<i32, HydstraError> {
        Ok(0)
    }

    fn shut_down(&mut self) -> Result<i32, HydstraError> {
        Ok(0)
    }

    fn json_call(&mut self, request: &str, _buffer_len: usize) -> Result<String, HydstraError> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(request.to_string())
            .send()?;

        if !response.status().is_success() {
            return Err(HydstraError::Transport(format!(
                "Hydstra web service error: {}",
                response.status()
            )));
        }

        Ok(response.text()?)
    }

    fn decode_error(&mut self, code: i32) -> String {
        format!("web service status {}", code)
    }

    fn channel(&self) -> Channel {
        Channel::WebService
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_handshake_is_a_no_op() {
        let config = WebServiceConfig {
            url: "http://127.0.0.1:9/cgi/webservice.exe".to_string(),
            timeout_secs: 1,
        };
        let mut transport = WebServiceTransport::new(&config).expect("client should build");
        let code = transport
            .start_up("", "", Path::new("Hyaccess.ini"), Path::new("HYCONFIG.INI"))
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(transport.shut_down().unwrap(), 0);
        assert_eq!(transport.channel(), Channel::WebService);
    }

    #[test]
    #[ignore] // Don't run in CI - depends on a reachable Hydstra web service
    fn webservice_site_list_round_trip() {
        use crate::rpc::hydllp::Hydllp;
        use crate::rpc::RpcClient;

        let url = std::env::var("HYDSTRA_WEBSERVICE_URL")
            .expect("set HYDSTRA_WEBSERVICE_URL to run this test");
        let config = WebServiceConfig {
            url,
            timeout_secs: 60,
        };
        let transport = WebServiceTransport::new(&config).unwrap();
        let hydllp_config = crate::config::HydllpConfig {
            ini_path: "".into(),
            dll_path: "".into(),
            hydllp_filename: String::new(),
            hyaccess_filename: String::new(),
            hyconfig_filename: String::new(),
            username: String::new(),
            password: String::new(),
            initial_buffer_len: 1400,
        };
        let mut hyd = Hydllp::new(transport, hydllp_config);
        hyd.login().unwrap();
        let sites = hyd.get_site_list("TSFILES(DSOURCES(A))").unwrap();
        assert!(!sites.is_empty());
        hyd.logout().unwrap();
    }
}
