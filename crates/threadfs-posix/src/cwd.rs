// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-thread working directory, kept separately for every bridge.

use std::cell::RefCell;
use std::collections::HashMap;

use threadfs_core::NodeId;

thread_local! {
    static CWD: RefCell<HashMap<u64, NodeId>> = RefCell::new(HashMap::new());
}

/// Working directory of this thread on `bridge`; the root until changed.
pub fn current(bridge: u64) -> NodeId {
    CWD.with(|cwd| cwd.borrow().get(&bridge).copied().unwrap_or(NodeId::ROOT))
}

pub fn set(bridge: u64, dir: NodeId) {
    CWD.with(|cwd| {
        cwd.borrow_mut().insert(bridge, dir);
    });
}

/// Every working directory of this thread, for handing to a child thread.
pub(crate) fn snapshot() -> HashMap<u64, NodeId> {
    CWD.with(|cwd| cwd.borrow().clone())
}

pub(crate) fn install(dirs: HashMap<u64, NodeId>) {
    CWD.with(|cwd| *cwd.borrow_mut() = dirs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_root_and_is_per_thread() {
        assert_eq!(current(42), NodeId::ROOT);
        set(42, NodeId(9));
        assert_eq!(current(42), NodeId(9));
        assert_eq!(current(43), NodeId::ROOT);

        let inherited = snapshot();
        let seen = std::thread::spawn(move || {
            let fresh = current(42);
            install(inherited);
            (fresh, current(42))
        })
        .join()
        .unwrap();
        assert_eq!(seen, (NodeId::ROOT, NodeId(9)));
    }
}
