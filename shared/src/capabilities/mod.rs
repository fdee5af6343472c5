mod connectivity;
mod http;
mod kv;

pub use self::connectivity::{
    connectivity_channel, ConnectivityError, ConnectivityEvent, ConnectivitySender, NetworkStatus,
};
pub use self::http::{
    local_path_for, FormPart, HttpClient, HttpError, HttpHeaders, HttpRequest, HttpResponse,
    HttpResult, MultipartForm, ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_REQUEST_BODY_SIZE,
    MAX_RESPONSE_BODY_SIZE, MAX_TIMEOUT_MS,
};
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKvStore, StorageErrorCode, TypedKvStore,
};

#[cfg(not(target_arch = "wasm32"))]
pub use self::http::ReqwestHttpClient;
#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;
