/// Access to the Hydstra server.
///
/// Submodules:
/// - `protocol`   — request variants, response envelope and per-call decoders.
/// - `hydllp`     — the `Transport` seam and the protocol client on top of it.
/// - `webservice` — a `Transport` over the Hydstra HTTP web service.
///
/// Pipeline stages talk to the server only through `RpcClient`; sessions are
/// scoped with `Session`, which logs out on every exit path.

pub mod hydllp;
pub mod protocol;
pub mod webservice;

use std::ops::{Deref, DerefMut};

use crate::logging::{self, Channel};
use crate::model::HydstraError;
use protocol::{
    BlockInfo, BlockInfoParams, DatasourceSites, RawTrace, RpcRequest, RpcReturn, TraceParams,
    VariablePeriod,
};

fn unexpected(request: &RpcRequest, got: &RpcReturn) -> HydstraError {
    HydstraError::Decode(format!(
        "{} answered with a {} return",
        request.function(),
        got.function()
    ))
}

/// A logged-in channel to the server.
///
/// Only `call` must be provided; the typed helpers check that the decoded
/// return matches the request.
pub trait RpcClient {
    fn call(&mut self, request: &RpcRequest) -> Result<RpcReturn, HydstraError>;

    /// Expands a site list expression into site ids.
    fn get_site_list(&mut self, expression: &str) -> Result<Vec<String>, HydstraError> {
        let request = RpcRequest::SiteList {
            expression: expression.to_string(),
        };
        match self.call(&request)? {
            RpcReturn::SiteList(sites) => Ok(sites),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Variables recorded at each site with their recorded period.
    fn get_variable_list(
        &mut self,
        sites: &[String],
        data_source: &str,
    ) -> Result<Vec<VariablePeriod>, HydstraError> {
        if sites.is_empty() {
            return Ok(Vec::new());
        }
        let request = RpcRequest::VariableList {
            sites: sites.to_vec(),
            data_source: data_source.to_string(),
        };
        match self.call(&request)? {
            RpcReturn::VariableList(periods) => Ok(periods),
            other => Err(unexpected(&request, &other)),
        }
    }

    fn get_sites_by_datasource(
        &mut self,
        data_sources: &[String],
    ) -> Result<Vec<DatasourceSites>, HydstraError> {
        let request = RpcRequest::SitesByDatasource {
            data_sources: data_sources.to_vec(),
        };
        match self.call(&request)? {
            RpcReturn::SitesByDatasource(sources) => Ok(sources),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Archive blocks modified within `params.start_modified..end_modified`.
    fn get_ts_blockinfo(&mut self, params: BlockInfoParams) -> Result<Vec<BlockInfo>, HydstraError> {
        if params.sites.is_empty() {
            return Err(HydstraError::Validation(
                "get_ts_blockinfo needs at least one site".to_string(),
            ));
        }
        let request = RpcRequest::TsBlockinfo(params);
        match self.call(&request)? {
            RpcReturn::TsBlockinfo(blocks) => Ok(blocks),
            other => Err(unexpected(&request, &other)),
        }
    }

    fn get_ts_traces(&mut self, params: TraceParams) -> Result<Vec<RawTrace>, HydstraError> {
        if params.sites.is_empty() {
            return Err(HydstraError::Validation(
                "get_ts_traces needs at least one site".to_string(),
            ));
        }
        let request = RpcRequest::TsTraces(params);
        match self.call(&request)? {
            RpcReturn::TsTraces(traces) => Ok(traces),
            other => Err(unexpected(&request, &other)),
        }
    }
}

/// An `RpcClient` whose server session must be explicitly opened and closed.
///
/// `release` must be idempotent: releasing a session that is not open is a
/// no-op.
pub trait SessionScope: RpcClient {
    fn acquire(&mut self) -> Result<(), HydstraError>;
    fn release(&mut self) -> Result<(), HydstraError>;
}

/// An open session. Releases on `close`, or on drop if never closed
/// (error paths), in which case a release failure is logged rather than
/// returned.
pub struct Session<'a, S: SessionScope + ?Sized> {
    client: &'a mut S,
    open: bool,
}

impl<'a, S: SessionScope + ?Sized> Session<'a, S> {
    pub fn open(client: &'a mut S) -> Result<Session<'a, S>, HydstraError> {
        client.acquire()?;
        Ok(Session { client, open: true })
    }

    /// Releases the session and reports any failure to do so.
    pub fn close(mut self) -> Result<(), HydstraError> {
        self.open = false;
        self.client.release()
    }
}

impl<S: SessionScope + ?Sized> Deref for Session<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &*self.client
    }
}

impl<S: SessionScope + ?Sized> DerefMut for Session<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut *self.client
    }
}

impl<S: SessionScope + ?Sized> Drop for Session<'_, S> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self.client.release() {
            logging::warn(
                Channel::Hydllp,
                None,
                &format!("session release after failure also failed: {}", e),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingClient {
        acquired: usize,
        released: usize,
        open: bool,
        fail_release: bool,
    }

    impl RpcClient for CountingClient {
        fn call(&mut self, _request: &RpcRequest) -> Result<RpcReturn, HydstraError> {
            if !self.open {
                return Err(HydstraError::Login("not logged in".into()));
            }
            Ok(RpcReturn::SiteList(vec!["70105".to_string()]))
        }
    }

    impl SessionScope for CountingClient {
        fn acquire(&mut self) -> Result<(), HydstraError> {
            self.acquired += 1;
            self.open = true;
            Ok(())
        }

        fn release(&mut self) -> Result<(), HydstraError> {
            if self.open {
                self.released += 1;
                self.open = false;
            }
            if self.fail_release {
                return Err(HydstraError::Login("shutdown failed".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_close_releases_once() {
        let mut client = CountingClient::default();
        let mut session = Session::open(&mut client).unwrap();
        assert_eq!(session.get_site_list("ALL").unwrap(), vec!["70105"]);
        session.close().unwrap();
        assert_eq!((client.acquired, client.released), (1, 1));
        assert!(!client.open);
    }

    #[test]
    fn test_drop_releases_on_error_path() {
        fn failing(client: &mut CountingClient) -> Result<(), HydstraError> {
            let _session = Session::open(client)?;
            Err(HydstraError::Decode("boom".into()))
        }
        let mut client = CountingClient::default();
        assert!(failing(&mut client).is_err());
        assert_eq!(client.released, 1);
    }

    #[test]
    fn test_close_reports_release_failure() {
        let mut client = CountingClient {
            fail_release: true,
            ..Default::default()
        };
        let session = Session::open(&mut client).unwrap();
        assert!(matches!(session.close(), Err(HydstraError::Login(_))));
        // close already released; drop must not release again
        assert_eq!(client.released, 1);
    }

    #[test]
    fn test_empty_site_list_rejected_before_call() {
        let mut client = CountingClient::default();
        let params = BlockInfoParams::new(Vec::new());
        // not logged in: reaching `call` would give a Login error instead
        assert!(matches!(
            client.get_ts_blockinfo(params),
            Err(HydstraError::Validation(_))
        ));
    }

    #[test]
    fn test_mismatched_return_is_decode_error() {
        let mut client = CountingClient::default();
        client.acquire().unwrap();
        let result = client.get_sites_by_datasource(&["A".to_string()]);
        assert!(matches!(result, Err(HydstraError::Decode(_))));
    }
}
