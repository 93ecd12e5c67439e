//! The transport abstraction: anything that can exchange a raw APDU with a
//! card. Generalizes the teacher's `transport/transport.rs` default-method
//! resubmission loop to the richer `StatusClass` this crate's `apdu` module
//! carries.

use crate::apdu::{Request, Response, StatusClass};
use crate::error::Result;

/// GET RESPONSE instruction byte, ISO 7816-4 §7.6.1.
const INS_GET_RESPONSE: u8 = 0xC0;

pub trait Transport {
    /// Performs exactly the APDU given, with no retry/chaining behaviour.
    /// Callers almost always want [`Transport::call_apdu`] instead.
    fn call_raw_apdu(&self, req: &Request) -> Result<Response>;

    /// Performs an APDU, transparently handling the two standard T=0/T=1
    /// follow-up mechanics: a `0x61XX` ("bytes remaining") status triggers a
    /// GET RESPONSE for the rest of the data, and a `0x6CXX` ("wrong Le")
    /// status triggers a single reissue with the Le the card asked for.
    fn call_apdu(&self, req: Request) -> Result<Response> {
        let res = self.call_raw_apdu(&req)?;
        match res.status.class() {
            StatusClass::OK => Ok(res),
            StatusClass::BytesRemaining(le) => {
                tracing::debug!(cla = req.cla, le, "bytes remaining, issuing GET RESPONSE");
                let get_response =
                    Request::new(req.cla, INS_GET_RESPONSE, 0x00, 0x00, Vec::new()).expect(le as usize);
                let mut rest = self.call_apdu(get_response)?;
                let mut data = res.data;
                data.append(&mut rest.data);
                rest.data = data;
                Ok(rest)
            }
            StatusClass::ErrRetryWithLe(le) => {
                tracing::debug!(le, "wrong Le, retrying");
                self.call_apdu(req.expect(le as usize))
            }
            _ => res.into_result(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::Status;
    use std::cell::RefCell;

    /// A fake transport that scripts a fixed sequence of raw responses, so
    /// the chaining logic in `call_apdu` can be exercised without a real
    /// card or reader.
    struct ScriptedTransport {
        responses: RefCell<Vec<Response>>,
        calls: RefCell<Vec<Request>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Response>) -> Self {
            Self {
                responses: RefCell::new(responses),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn call_raw_apdu(&self, req: &Request) -> Result<Response> {
            self.calls.borrow_mut().push(req.clone());
            Ok(self.responses.borrow_mut().remove(0))
        }
    }

    #[test]
    fn test_ok_response_returned_directly() {
        let transport = ScriptedTransport::new(vec![Response::new(Status(0x90, 0x00), vec![0x01])]);
        let res = transport
            .call_apdu(Request::new(0x00, 0xA4, 0x04, 0x00, Vec::new()))
            .unwrap();
        assert_eq!(res.data, vec![0x01]);
    }

    #[test]
    fn test_bytes_remaining_triggers_get_response() {
        let transport = ScriptedTransport::new(vec![
            Response::new(Status(0x61, 0x10), Vec::new()),
            Response::new(Status(0x90, 0x00), vec![0xAA; 0x10]),
        ]);
        let res = transport
            .call_apdu(Request::new(0x00, 0xA4, 0x04, 0x00, Vec::new()))
            .unwrap();
        assert_eq!(res.data.len(), 0x10);
        let calls = transport.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].ins, 0xC0);
        assert_eq!(calls[1].le, Some(0x10));
    }

    #[test]
    fn test_bytes_remaining_concatenates_leading_data() {
        let transport = ScriptedTransport::new(vec![
            Response::new(Status(0x61, 0x02), vec![0x11, 0x22]),
            Response::new(Status(0x90, 0x00), vec![0x33, 0x44]),
        ]);
        let res = transport
            .call_apdu(Request::new(0x00, 0xA4, 0x04, 0x00, Vec::new()))
            .unwrap();
        assert_eq!(res.data, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_wrong_le_triggers_retry() {
        let transport = ScriptedTransport::new(vec![
            Response::new(Status(0x6C, 0x1D), Vec::new()),
            Response::new(Status(0x90, 0x00), vec![0xBB; 0x1D]),
        ]);
        let res = transport
            .call_apdu(Request::new(0x00, 0xB2, 0x01, 0x0C, Vec::new()).expect(0x00))
            .unwrap();
        assert_eq!(res.data.len(), 0x1D);
        let calls = transport.calls.borrow();
        assert_eq!(calls[1].le, Some(0x1D));
    }

    #[test]
    fn test_card_error_propagates() {
        let transport = ScriptedTransport::new(vec![Response::new(Status(0x69, 0x85), Vec::new())]);
        let err = transport
            .call_apdu(Request::new(0x00, 0x20, 0x00, 0x80, vec![0x24]))
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::ErrorResponse { .. }));
    }
}
