// Module audio - exécuteur temps-réel et backend CPAL

pub mod diagnostics;
pub mod executor;
pub mod format_conversion;
pub mod status;
pub mod stream;
pub mod timing;
