//! Shared constants: context keys and definition tags.
//!
//! Flow and connection definitions are plain JSON documents whose field names
//! are fixed uppercase tags; request/flow contexts are keyed by the constants
//! in [`context_keys`]. Keeping them in one place avoids stringly-typed drift
//! between the channel, flow and connector layers.

/// Well-known keys of the request (channel) and flow contexts.
pub mod context_keys {
    pub const API: &str = "API";
    pub const CHANNEL_ID: &str = "CHANNEL_ID";

    pub const REQUEST_PATH_VARIABLES: &str = "REQUEST_PATH_VARIABLES";
    pub const REQUEST_PARAMS: &str = "REQUEST_PARAMS";
    pub const REQUEST_BODY: &str = "REQUEST_BODY";
    pub const REQUEST_METHOD: &str = "REQUEST_METHOD";

    pub const API_META: &str = "API_META";

    /// Inline flow definition carried in the request itself.
    pub const FLOW: &str = "FLOW";

    /// The parent channel context, visible from a flow context.
    pub const CHANNEL: &str = "CHANNEL";

    pub const LATEST_RESULT: &str = "LATEST_RESULT";
    pub const LATEST_MSG: &str = "LATEST_MSG";
}

/// Field tags of flow/module definition documents.
pub mod flow_tags {
    pub const ENTRY: &str = "ENTRY";
    pub const DEBUG: &str = "DEBUG";
    pub const SPOOLING: &str = "SPOOLING";
    pub const MODULE: &str = "MODULE";
    pub const RULE: &str = "RULE";

    pub const ACTION: &str = "ACTION";
    pub const CONNECT: &str = "CONNECT";
    pub const TEMPLATE: &str = "TEMPLATE";
    pub const CALL: &str = "CALL";
    pub const PIPE: &str = "PIPE";
    pub const TARGET: &str = "TARGET";
    pub const SQL: &str = "SQL";
    pub const CONDITION: &str = "CONDITION";
    pub const BATCHSIZE: &str = "BATCHSIZE";
    pub const BUFFERSIZE: &str = "BUFFERSIZE";
    pub const FETCHSIZE: &str = "FETCHSIZE";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const RESULT: &str = "RESULT";
}

/// Field tags of connection-info documents.
pub mod connector_tags {
    pub const CONNECTOR: &str = "CONNECTOR";
    pub const URL: &str = "URL";
    pub const USER: &str = "USER";
    pub const PASSWORD: &str = "PASSWORD";
    pub const DBTYPE: &str = "DBTYPE";
    pub const PASSIVE: &str = "PASSIVE";
    pub const TIMEOUT: &str = "TIMEOUT";
}

/// Field tags of API definition documents.
pub mod api_tags {
    pub const TARGET: &str = "TARGET";
    pub const BACKUP_PAYLOAD: &str = "BACKUP_PAYLOAD";
    pub const CONCURRENCY: &str = "CONCURRENCY";
    pub const ENABLE: &str = "ENABLE";
}

/// Tags of the documents persisted by the engine itself.
pub mod spool_tags {
    pub const TARGET: &str = "target";
    pub const CONTEXT: &str = "context";
}

/// Header/items tags of payload documents.
pub mod payload_tags {
    pub const HEADER: &str = "HEADER";
    pub const ITEMS: &str = "ITEMS";
}
