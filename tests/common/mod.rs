//! Scripted serial endpoint for driving the protocol drivers off-hardware

// Each integration test binary compiles its own copy; not every binary uses
// every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use arduflash::connection::SerialLink;
use arduflash::error::{Error, Result};

/// Control-line and reopen activity observed by the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    SetLines(bool, bool),
    ReopenAt(u32),
    ClearInput,
}

enum Expect {
    Bytes(Vec<u8>),
    /// Match on length only; used for opaque blobs like the flashing applet.
    Len(usize),
}

struct Exchange {
    expect: Expect,
    reply: Vec<u8>,
}

/// A serial endpoint that answers from a script
///
/// Every `write_all` is matched against the next expected request; its
/// scripted reply becomes readable. An exhausted or mismatched script
/// panics, which is exactly what a protocol regression should do in a test.
pub struct ScriptedLink {
    script: VecDeque<Exchange>,
    pending: VecDeque<u8>,
    pub writes: Vec<Vec<u8>>,
    pub events: Vec<LinkEvent>,
    baud: u32,
}

impl ScriptedLink {
    pub fn new(baud: u32) -> Self {
        ScriptedLink {
            script: VecDeque::new(),
            pending: VecDeque::new(),
            writes: Vec::new(),
            events: Vec::new(),
            baud,
        }
    }

    pub fn expect(&mut self, write: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) {
        self.script.push_back(Exchange {
            expect: Expect::Bytes(write.as_ref().to_vec()),
            reply: reply.as_ref().to_vec(),
        });
    }

    pub fn expect_raw_len(&mut self, len: usize) {
        self.script.push_back(Exchange {
            expect: Expect::Len(len),
            reply: Vec::new(),
        });
    }

    pub fn assert_done(&self) {
        assert!(
            self.script.is_empty(),
            "{} scripted exchanges never happened",
            self.script.len()
        );
        assert!(self.pending.is_empty(), "unread reply bytes left over");
    }

    /// The command strings written, for sequence assertions.
    pub fn written_strings(&self) -> Vec<String> {
        self.writes
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }
}

impl SerialLink for ScriptedLink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.writes.push(bytes.to_vec());

        let exchange = self
            .script
            .pop_front()
            .unwrap_or_else(|| panic!("write beyond script: {bytes:02x?}"));
        match &exchange.expect {
            Expect::Bytes(expected) => assert_eq!(
                bytes,
                &expected[..],
                "device received an unexpected request"
            ),
            Expect::Len(len) => assert_eq!(
                bytes.len(),
                *len,
                "device received a blob of the wrong size"
            ),
        }
        self.pending.extend(exchange.reply);
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if self.pending.is_empty() {
            return Err(Error::ReadTimeout);
        }
        let n = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending.pop_front().unwrap();
        }
        Ok(n)
    }

    fn set_lines(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.events.push(LinkEvent::SetLines(dtr, rts));
        Ok(())
    }

    fn reopen_at(&mut self, baud: u32) -> Result<()> {
        self.events.push(LinkEvent::ReopenAt(baud));
        self.baud = baud;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.events.push(LinkEvent::ClearInput);
        self.pending.clear();
        Ok(())
    }

    fn baud(&self) -> u32 {
        self.baud
    }
}
