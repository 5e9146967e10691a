//! Environment variable names recognized by the gateway.

/// Selects the environment profile for logging (`development` / `production`).
pub const ENV: &str = "SYN4PSE_ENV";

/// Overrides the HTTP listen port.
pub const SERVER_HTTP_PORT: &str = "SYN4PSE_SERVER_HTTP_PORT";

/// Overrides the gRPC port (reserved, no gRPC surface is mounted).
pub const SERVER_GRPC_PORT: &str = "SYN4PSE_SERVER_GRPC_PORT";

/// Overrides the models directory.
pub const MODELS_PATH: &str = "SYN4PSE_MODELS_PATH";

/// Selects the chat-completion adapter shape: `cli` (default) or `server`.
pub const LLM_MODE: &str = "SYN4PSE_LLM_MODE";

/// Selects the transcription adapter shape: `server` (default) or `cli`.
pub const STT_MODE: &str = "SYN4PSE_STT_MODE";

/// Path to the one-shot llama.cpp binary.
pub const LLAMA_CLI_BIN: &str = "SYN4PSE_LLAMA_CLI_BIN";

/// Path to the llama-server binary.
pub const LLAMA_SERVER_BIN: &str = "SYN4PSE_LLAMA_SERVER_BIN";

/// Path to the one-shot whisper.cpp binary.
pub const WHISPER_CLI_BIN: &str = "SYN4PSE_WHISPER_CLI_BIN";

/// Path to the whisper-server binary.
pub const WHISPER_SERVER_BIN: &str = "SYN4PSE_WHISPER_SERVER_BIN";

/// Path to the piper binary.
pub const PIPER_BIN: &str = "SYN4PSE_PIPER_BIN";
