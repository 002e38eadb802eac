use std::borrow::BorrowMut;
use std::path::Path;

use ahash::HashMapExt;
use aya::maps::{HashMap, Map, MapData};
use egress_gateway_ebpf_common::egress::{EgressPolicyKey, EgressPolicyValue};

use crate::Result;

/// Userspace handle on the datapath egress policy map.
///
/// `get_state` snapshots the whole map; the reconciler diffs against the
/// snapshot rather than issuing per-key lookups.
pub trait EgressPolicyMap {
    fn update(&mut self, key: EgressPolicyKey, value: EgressPolicyValue) -> Result<()>;
    fn delete(&mut self, key: &EgressPolicyKey) -> Result<()>;
    fn get_state(&self) -> Result<ahash::HashMap<EgressPolicyKey, EgressPolicyValue>>;
}

impl<T: BorrowMut<MapData>> EgressPolicyMap for HashMap<T, EgressPolicyKey, EgressPolicyValue> {
    fn update(&mut self, key: EgressPolicyKey, value: EgressPolicyValue) -> Result<()> {
        Ok(self.insert(key, value, 0)?)
    }

    fn delete(&mut self, key: &EgressPolicyKey) -> Result<()> {
        Ok(self.remove(key)?)
    }

    fn get_state(&self) -> Result<ahash::HashMap<EgressPolicyKey, EgressPolicyValue>> {
        let mut state = ahash::HashMap::new();
        for kv in self.iter() {
            match kv {
                Ok((k, v)) => {
                    state.insert(k, v);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(state)
    }
}

/// Opens the egress policy map pinned by the datapath loader.
pub fn open_pinned_policy_map(
    path: impl AsRef<Path>,
) -> Result<HashMap<MapData, EgressPolicyKey, EgressPolicyValue>> {
    let data = MapData::from_pin(path)?;
    let map = Map::HashMap(data);
    Ok(map.try_into()?)
}
