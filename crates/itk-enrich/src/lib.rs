//! Document enrichment and family-linking engine.
//!
//! Deterministic, identity-driven reconciliation over the repository port:
//! fill empty payload fields from prior records with the same natural
//! identity, score merge candidates across the corpus, and maintain
//! bidirectional family references between person records.
//!
//! Everything here only *fills*, never overwrites — conflicts are observed
//! and reported, not resolved.

mod fill;
mod identity;
mod paths;
mod service;

pub use fill::{enrich_payload_fill_empty, merge_family_links};
pub use identity::{
    family_reference_from_payload, identity_candidates, name_tokens, normalize_identity,
    split_full_name, FamilyReference,
};
pub use paths::{safe_get, safe_set};
pub use service::{
    EnrichmentRequest, EnrichmentService, EnrichmentSettings, FamilySyncOutcome,
    IdentityEnrichmentOutcome, IntakeProfile, MatchReason, MergeCandidate, RecordStore,
};

/// The fixed dotted paths participating in fill-empty enrichment. The
/// payload schema is open for unknown keys, but only these paths are ever
/// read or written by the engine.
pub const ENRICHMENT_PATHS: &[&str] = &[
    "identificacion.nif_nie",
    "identificacion.pasaporte",
    "identificacion.documento_tipo",
    "identificacion.nombre_apellidos",
    "identificacion.primer_apellido",
    "identificacion.segundo_apellido",
    "identificacion.nombre",
    "domicilio.tipo_via",
    "domicilio.nombre_via",
    "domicilio.numero",
    "domicilio.escalera",
    "domicilio.piso",
    "domicilio.puerta",
    "domicilio.telefono",
    "domicilio.municipio",
    "domicilio.provincia",
    "domicilio.cp",
    "declarante.localidad",
    "declarante.fecha",
    "declarante.fecha_dia",
    "declarante.fecha_mes",
    "declarante.fecha_anio",
    "ingreso.forma_pago",
    "ingreso.iban",
    "extra.email",
    "extra.fecha_nacimiento",
    "extra.fecha_nacimiento_dia",
    "extra.fecha_nacimiento_mes",
    "extra.fecha_nacimiento_anio",
    "extra.nacionalidad",
    "extra.pais_nacimiento",
    "extra.sexo",
    "extra.estado_civil",
    "extra.lugar_nacimiento",
    "extra.nombre_padre",
    "extra.nombre_madre",
    "extra.representante_legal",
    "extra.representante_documento",
    "extra.titulo_representante",
    "extra.hijos_escolarizacion_espana",
];
