/* Scripted loopback port for tests: input is queued by the test, output
 * is captured for assertion. */

use std::collections::VecDeque;
use std::io;

pub struct MockPort {
    input: VecDeque<u8>,
    output: Vec<u8>,
    replies: Vec<(Vec<u8>, Vec<u8>)>,
    broken: bool,
}

impl MockPort {
    pub fn new() -> Self {
        Self {
            input: VecDeque::new(),
            output: Vec::new(),
            replies: Vec::new(),
            broken: false,
        }
    }

    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes);
    }

    /* Script a device response: when a write starts with `trigger`, the
     * reply lands in the input queue. One-shot, first match wins. */
    pub fn reply_on_write(&mut self, trigger: &[u8], reply: &[u8]) {
        self.replies.push((trigger.to_vec(), reply.to_vec()));
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /* Simulate a dead link: every operation fails from now on. */
    pub fn break_link(&mut self) {
        self.broken = true;
    }

    fn check(&self) -> io::Result<()> {
        if self.broken {
            Err(io::Error::new(io::ErrorKind::NotConnected, "mock link down"))
        } else {
            Ok(())
        }
    }

    pub fn wait_readable(&mut self) -> io::Result<bool> {
        self.check()?;
        Ok(!self.input.is_empty())
    }

    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        let mut count = 0;
        while count < buf.len() {
            match self.input.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.check()?;
        self.output.extend_from_slice(data);
        if let Some(position) = self
            .replies
            .iter()
            .position(|(trigger, _)| data.starts_with(trigger))
        {
            let (_, reply) = self.replies.remove(position);
            self.input.extend(reply);
        }
        Ok(data.len())
    }

    pub fn discard_input(&mut self) -> io::Result<()> {
        self.check()?;
        self.input.clear();
        Ok(())
    }
}
