//! PC/SC transport: talks to a real reader via the `pcsc` crate.

use crate::apdu::{Request, Response};
use crate::error::Result;
use crate::transport::Transport;

pub const DEFAULT_MAX_LE: usize = 256;

/// Owns a connected `pcsc::Card` for the lifetime of the session; the
/// connection is released (and the card session ended, per `pcsc`'s RAII
/// `Drop` impl) when this is dropped.
pub struct PcscTransport {
    card: pcsc::Card,
    max_le: usize,
}

impl PcscTransport {
    pub fn new(card: pcsc::Card) -> Self {
        Self {
            card,
            max_le: DEFAULT_MAX_LE,
        }
    }
}

impl Transport for PcscTransport {
    fn call_raw_apdu(&self, req: &Request) -> Result<Response> {
        let le = req.le.unwrap_or(self.max_le);

        tracing::debug!(
            cla = req.cla,
            ins = req.ins,
            p1 = req.p1,
            p2 = req.p2,
            lc = req.data.len(),
            le,
            "sending APDU",
        );

        let req_bytes = req.to_bytes();
        let mut res_buf = [0; pcsc::MAX_BUFFER_SIZE];
        let res_data = self.card.transmit(&req_bytes, &mut res_buf)?;
        let res = Response::parse(res_data)?;
        tracing::debug!(status = %res.status, len = res.data.len(), "received APDU response");
        Ok(res)
    }
}
