//! Incremental scanner for `_changes` response bodies.
//!
//! A normal-mode changes response is one large JSON object whose `results`
//! member is an array of change records. Long feeds must not be buffered
//! whole, so this scanner consumes arbitrary chunks, skips to the `results`
//! array, and yields each element as a complete JSON object for the caller
//! to parse individually.

use crate::error::{ReplicationError, ReplicationResult};

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    /// Before the opening `{` of the response object.
    Start,
    /// Inside the top-level object, between members.
    TopLevel,
    /// Reading a member key.
    Key,
    /// After a key, waiting for `:`.
    AfterKey { is_results: bool },
    /// Skipping an uninteresting member value.
    SkipValue,
    /// After `"results":`, waiting for `[`.
    SeekArray,
    /// Inside the results array, between elements.
    InArray,
    /// Capturing one change record object.
    InObject,
    /// The results array (or the whole object) has ended.
    Done,
}

/// Pull-style extractor for the objects of the top-level `results` array.
#[derive(Debug)]
pub struct ResultsScanner {
    state: State,
    depth: usize,
    in_string: bool,
    escaped: bool,
    key_buf: String,
    object_buf: Vec<u8>,
}

impl Default for ResultsScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultsScanner {
    /// A scanner at the start of a response body.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Start,
            depth: 0,
            in_string: false,
            escaped: false,
            key_buf: String::new(),
            object_buf: Vec::new(),
        }
    }

    /// Whether the results array has been fully consumed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Consumes the next chunk of the body, returning the serialised bytes
    /// of every change record completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> ReplicationResult<Vec<Vec<u8>>> {
        let mut records = Vec::new();
        for &byte in chunk {
            self.step(byte, &mut records)?;
        }
        Ok(records)
    }

    fn step(&mut self, byte: u8, records: &mut Vec<Vec<u8>>) -> ReplicationResult<()> {
        match self.state {
            State::Start => match byte {
                b'{' => self.state = State::TopLevel,
                b if b.is_ascii_whitespace() => {}
                other => {
                    return Err(ReplicationError::Protocol(format!(
                        "changes body does not start with an object (got {:?})",
                        char::from(other)
                    )))
                }
            },
            State::TopLevel => match byte {
                b'"' => {
                    self.key_buf.clear();
                    self.escaped = false;
                    self.state = State::Key;
                }
                b'}' => self.state = State::Done,
                b',' | b':' => {}
                b if b.is_ascii_whitespace() => {}
                other => {
                    return Err(ReplicationError::Protocol(format!(
                        "unexpected {:?} in changes object",
                        char::from(other)
                    )))
                }
            },
            State::Key => {
                if self.escaped {
                    self.escaped = false;
                    self.key_buf.push(byte as char);
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.state = State::AfterKey {
                        is_results: self.key_buf == "results",
                    };
                } else {
                    self.key_buf.push(byte as char);
                }
            }
            State::AfterKey { is_results } => match byte {
                b':' => {
                    self.state = if is_results {
                        State::SeekArray
                    } else {
                        self.depth = 0;
                        self.in_string = false;
                        self.escaped = false;
                        State::SkipValue
                    };
                }
                b if b.is_ascii_whitespace() => {}
                other => {
                    return Err(ReplicationError::Protocol(format!(
                        "expected ':' after key, got {:?}",
                        char::from(other)
                    )))
                }
            },
            State::SkipValue => {
                if self.in_string {
                    if self.escaped {
                        self.escaped = false;
                    } else if byte == b'\\' {
                        self.escaped = true;
                    } else if byte == b'"' {
                        self.in_string = false;
                        if self.depth == 0 {
                            self.state = State::TopLevel;
                        }
                    }
                } else {
                    match byte {
                        b'"' => self.in_string = true,
                        b'{' | b'[' => self.depth += 1,
                        b'}' | b']' if self.depth > 0 => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                self.state = State::TopLevel;
                            }
                        }
                        b'}' => self.state = State::Done,
                        b',' if self.depth == 0 => self.state = State::TopLevel,
                        _ => {}
                    }
                }
            }
            State::SeekArray => match byte {
                b'[' => self.state = State::InArray,
                b if b.is_ascii_whitespace() => {}
                other => {
                    return Err(ReplicationError::Protocol(format!(
                        "results is not an array (got {:?})",
                        char::from(other)
                    )))
                }
            },
            State::InArray => match byte {
                b'{' => {
                    self.object_buf.clear();
                    self.object_buf.push(b'{');
                    self.depth = 1;
                    self.in_string = false;
                    self.escaped = false;
                    self.state = State::InObject;
                }
                b']' => self.state = State::Done,
                b',' => {}
                b if b.is_ascii_whitespace() => {}
                other => {
                    return Err(ReplicationError::Protocol(format!(
                        "unexpected {:?} in results array",
                        char::from(other)
                    )))
                }
            },
            State::InObject => {
                self.object_buf.push(byte);
                if self.in_string {
                    if self.escaped {
                        self.escaped = false;
                    } else if byte == b'\\' {
                        self.escaped = true;
                    } else if byte == b'"' {
                        self.in_string = false;
                    }
                } else {
                    match byte {
                        b'"' => self.in_string = true,
                        b'{' => self.depth += 1,
                        b'}' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                records.push(std::mem::take(&mut self.object_buf));
                                self.state = State::InArray;
                            }
                        }
                        _ => {}
                    }
                }
            }
            State::Done => {}
        }
        Ok(())
    }
}
