//! Round-robin rotation over the ports of one service.

use thiserror::Error;

/// Error returned by [`PortCursor::next`] when there is nothing to rotate over.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("ports of service are empty in ports mapping file")]
pub struct EmptyPortList;

/// An ordered list of ports plus the position of the next one to hand out.
///
/// The cursor is not synchronized. [`crate::mapping::ServiceMapping`] only
/// advances it while holding its table lock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortCursor {
    ports: Vec<u16>,
    offset: usize,
}

impl PortCursor {
    /// Create a cursor positioned at the first port.
    pub fn new(ports: Vec<u16>) -> Self {
        Self { ports, offset: 0 }
    }

    /// The ports in rotation order.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Return the current port and advance, wrapping at the end.
    pub fn next(&mut self) -> Result<u16, EmptyPortList> {
        let port = *self.ports.get(self.offset).ok_or(EmptyPortList)?;
        self.offset += 1;
        if self.offset == self.ports.len() {
            self.offset = 0;
        }
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_in_order() {
        let mut c = PortCursor::new(vec![5001, 5002, 5003]);
        assert_eq!(c.next(), Ok(5001));
        assert_eq!(c.next(), Ok(5002));
        assert_eq!(c.next(), Ok(5003));
        assert_eq!(c.next(), Ok(5001));
    }

    #[test]
    fn single_port_repeats() {
        let mut c = PortCursor::new(vec![80]);
        for _ in 0..3 {
            assert_eq!(c.next(), Ok(80));
        }
    }

    #[test]
    fn empty_is_an_error() {
        let mut c = PortCursor::new(Vec::new());
        assert_matches!(c.next(), Err(EmptyPortList));
        assert_matches!(c.next(), Err(EmptyPortList));
    }
}
