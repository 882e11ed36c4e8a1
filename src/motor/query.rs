// Telemetry query registration
//
// The order in which channels are registered is the order in which the controller
// emits their values in every telemetry frame. The setup string and the decoder
// must share the same registry.

/// One telemetry channel and the controller query that feeds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBinding {
    pub channel_name: String,
    pub query_code: String,
    pub slot_index: usize,
}

/// Ordered, immutable set of telemetry channels
#[derive(Debug, Clone, Default)]
pub struct QueryRegistry {
    bindings: Vec<QueryBinding>,
}

impl QueryRegistry {
    /// Build the registry; each entry's slot is its position in `entries`
    pub fn new<I, N, Q>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, Q)>,
        N: Into<String>,
        Q: Into<String>,
    {
        let bindings = entries
            .into_iter()
            .enumerate()
            .map(|(slot_index, (name, query))| QueryBinding {
                channel_name: name.into(),
                query_code: query.into(),
                slot_index,
            })
            .collect();

        Self { bindings }
    }

    pub fn bindings(&self) -> &[QueryBinding] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn get(&self, slot_index: usize) -> Option<&QueryBinding> {
        self.bindings.get(slot_index)
    }

    /// Setup string sent once at startup
    ///
    /// Turns off command echo, then installs a script that prints `DH` followed by
    /// one `?`-prefixed group per query, repeated at `frequency` Hz.
    pub fn setup_string(&self, frequency: i64) -> String {
        let mut setup = String::from("^echof 1_");
        setup.push_str("#c_\"DH?\",\"?\"");
        for binding in &self.bindings {
            setup.push_str(&binding.query_code);
            setup.push('_');
        }
        setup.push_str(&format!("# {}_", frequency));
        setup
    }
}
