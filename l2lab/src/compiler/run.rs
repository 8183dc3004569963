/// Highest usable 802.1Q tag, 4095 is reserved
pub const MAX_VID: u16 = 4094;

/// Allocation state for one compile. Everything handed out here is unique within the run and a
/// fresh run over the same input hands out exactly the same identifiers.
#[derive(Debug, Clone)]
pub struct CompileRun {
    last_vid: u16,
    next_tunnel_key: u32,
    next_veth: u32,
}

impl Default for CompileRun {
    fn default() -> Self {
        Self {
            // vid 1 is the native vlan, the first logical bridge gets 2
            last_vid: 1,
            next_tunnel_key: 1,
            next_veth: 0,
        }
    }
}

impl CompileRun {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next free 802.1Q tag, `None` once 4094 has been handed out
    pub fn next_vid(&mut self) -> Option<u16> {
        if self.last_vid >= MAX_VID {
            return None;
        }
        self.last_vid += 1;
        Some(self.last_vid)
    }

    /// Returns the key and the device name of a new gretap link
    pub fn next_tunnel(&mut self) -> (u32, String) {
        let key = self.next_tunnel_key;
        self.next_tunnel_key += 1;
        (key, format!("gretap{key}"))
    }

    /// Returns `(bridge side, namespace side)` of a new veth pair
    pub fn next_veth_pair(&mut self) -> (String, String) {
        let n = self.next_veth;
        self.next_veth += 2;
        (format!("veth{n}"), format!("veth{}", n + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_sequence() {
        let mut run = CompileRun::new();
        assert_eq!(run.next_vid(), Some(2));
        assert_eq!(run.next_vid(), Some(3));
        assert_eq!(run.next_tunnel(), (1, "gretap1".to_string()));
        assert_eq!(run.next_tunnel(), (2, "gretap2".to_string()));
        assert_eq!(run.next_veth_pair(), ("veth0".to_string(), "veth1".to_string()));
        assert_eq!(run.next_veth_pair(), ("veth2".to_string(), "veth3".to_string()));
    }

    #[test]
    fn test_vid_space_ends_at_4094() {
        let mut run = CompileRun::new();
        let vids: Vec<u16> = std::iter::from_fn(|| run.next_vid()).collect();
        assert_eq!(vids.len(), 4093);
        assert_eq!(vids.last(), Some(&MAX_VID));
        assert_eq!(run.next_vid(), None);
    }
}
