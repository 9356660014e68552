use std::fmt;

/// Classifies the requests recorded into [`Statistics`][super::Statistics].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// A read that found a value.
    Get,
    /// A read that found no value.
    ///
    /// Recorded separately because unexpected empty reads are the first sign of lost data.
    GetNull,
    /// A write.
    Put,
    /// A removal.
    Remove,
    /// A whole transaction, measured from its start to its commit or rollback.
    ///
    /// Not counted in the request totals, since its duration overlaps with the operations it
    /// contains.
    Transaction,
}

impl Operation {
    /// All operations, in the order in which they are stored and exported.
    pub const ALL: [Operation; 5] = [
        Operation::Get,
        Operation::GetNull,
        Operation::Put,
        Operation::Remove,
        Operation::Transaction,
    ];

    /// The number of operation kinds.
    pub const COUNT: usize = Self::ALL.len();

    /// The position of the operation in [`Operation::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// The name used in result maps.
    pub fn name(self) -> &'static str {
        match self {
            Operation::Get => "GET",
            Operation::GetNull => "GET_NULL",
            Operation::Put => "PUT",
            Operation::Remove => "REMOVE",
            Operation::Transaction => "TRANSACTION",
        }
    }

    /// Returns `true` for the operations that contribute to the request totals.
    pub fn is_request(self) -> bool {
        self != Operation::Transaction
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
