// Adapters implementing the application ports

pub mod http_client;
pub mod llm_client;
pub mod pdf_tools;

pub use http_client::ReqwestHttp;
pub use llm_client::OpenAiCompatibleGenerator;
pub use pdf_tools::PopplerPdfExtractor;
