pub mod artifact_store;
pub mod de_builder;
pub mod packager;
pub mod patcher;
pub mod qr;
pub mod response_parser;
pub mod signer;

pub use artifact_store::{ArtifactKind, ArtifactStore};
pub use de_builder::DeBuilder;
pub use packager::{package, PackagedLot};
pub use patcher::{Discrepancy, PatchReport, XmlPatcher};
pub use qr::QrBuilder;
pub use signer::{DocumentSigner, XmlsecSigner};
