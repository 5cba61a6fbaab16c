use crate::host::Catalog;
use crate::trace::model::BufferTagInfo;

/// Relation fork a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ForkNumber {
    Main,
    FreeSpaceMap,
    VisibilityMap,
    Init,
}

impl ForkNumber {
    pub fn name(self) -> &'static str {
        match self {
            ForkNumber::Main => "main",
            ForkNumber::FreeSpaceMap => "fsm",
            ForkNumber::VisibilityMap => "vm",
            ForkNumber::Init => "init",
        }
    }
}

/// Identity of a data page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferTag {
    pub spc_oid: u32,
    pub db_oid: u32,
    pub rel_number: u32,
    pub fork: ForkNumber,
    pub block_number: u32,
}

impl BufferTag {
    pub fn new(spc_oid: u32, db_oid: u32, rel_number: u32, fork: ForkNumber, block_number: u32) -> Self {
        Self {
            spc_oid,
            db_oid,
            rel_number,
            fork,
            block_number,
        }
    }

    /// Resolves object names. Names the catalog does not know stay empty.
    pub fn decode(&self, catalog: &dyn Catalog) -> BufferTagInfo {
        let relation = catalog.relation(self.db_oid, self.rel_number);
        BufferTagInfo {
            spc_oid: self.spc_oid,
            spc_name: catalog.tablespace_name(self.spc_oid),
            db_oid: self.db_oid,
            db_name: catalog.database_name(self.db_oid),
            rel_number: self.rel_number,
            rel_name: relation
                .as_ref()
                .map(|r| format!("{}.{}", r.namespace, r.name)),
            rel_kind: relation.map(|r| r.kind.to_string()),
            fork_name: self.fork.name().to_string(),
            block_number: self.block_number,
        }
    }
}
