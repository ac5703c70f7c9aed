//! Serialization identifiers for messages and stored documents
//!
//! Every payload that crosses the queue or lands in a store is tagged with a
//! numeric identifier from this table. Identifiers are never reused; a new
//! layout of an existing payload gets a new entry and bumps [`SCHEMA_VERSION`].

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaEntry {
    pub id: u32,
    pub name: &'static str,
}

pub const NODE_START_EVENT: u32 = 100;
pub const FACILITATOR_EVENT: u32 = 101;
pub const ADVISE_EVENT: u32 = 102;
pub const INTERRUPT_EVENT: u32 = 103;
pub const SDK_RESPONSE_EVENT: u32 = 104;

pub const NODE_EXECUTION: u32 = 200;
pub const BARRIER_INSTANCE: u32 = 201;
pub const INTERRUPT: u32 = 202;
pub const RUN_RECORD: u32 = 203;

pub const ENTRIES: &[SchemaEntry] = &[
    SchemaEntry { id: NODE_START_EVENT, name: "NodeStartEvent" },
    SchemaEntry { id: FACILITATOR_EVENT, name: "FacilitatorEvent" },
    SchemaEntry { id: ADVISE_EVENT, name: "AdviseEvent" },
    SchemaEntry { id: INTERRUPT_EVENT, name: "InterruptEvent" },
    SchemaEntry { id: SDK_RESPONSE_EVENT, name: "SdkResponseEvent" },
    SchemaEntry { id: NODE_EXECUTION, name: "NodeExecution" },
    SchemaEntry { id: BARRIER_INSTANCE, name: "BarrierInstance" },
    SchemaEntry { id: INTERRUPT, name: "Interrupt" },
    SchemaEntry { id: RUN_RECORD, name: "RunRecord" },
];

const fn str_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

const fn has_duplicates(entries: &[SchemaEntry]) -> bool {
    let mut i = 0;
    while i < entries.len() {
        let mut j = i + 1;
        while j < entries.len() {
            if entries[i].id == entries[j].id || str_eq(entries[i].name, entries[j].name) {
                return true;
            }
            j += 1;
        }
        i += 1;
    }
    false
}

const _: () = assert!(!has_duplicates(ENTRIES), "duplicate schema identifier");

pub fn name_of(id: u32) -> Option<&'static str> {
    ENTRIES.iter().find(|e| e.id == id).map(|e| e.name)
}

pub fn id_of(name: &str) -> Option<u32> {
    ENTRIES.iter().find(|e| e.name == name).map(|e| e.id)
}
