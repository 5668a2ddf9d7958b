//! Entity classes of the knowledge base.
//!
//! The class tree is:
//!
//! ```text
//! KBObject
//! ├── Study
//! ├── Action
//! ├── Individual
//! └── Result
//!     ├── Sample
//!     │   └── BioSample
//!     │       └── DNASample
//!     └── DataSample
//!         └── GenotypeDataSample
//! ```

use super::{default_validation_error, Conf, EntityClass, Field, FieldType, Value};
use crate::error::ValidationFailure;
use crate::KBError;

use chrono::{SubsecRound, Utc};

//-----------------------------------------------------------------------------

/// Gender of an individual.
pub const GENDER: &str = "Gender";

/// Category of an action.
pub const ACTION_CATEGORY: &str = "ActionCategory";

/// Content of a vessel holding a biological sample.
pub const VESSEL_CONTENT: &str = "VesselContent";

/// Status of a data sample.
pub const DATA_SAMPLE_STATUS: &str = "DataSampleStatus";

/// Enumerations and their values, seeded into a new knowledge base.
pub const ENUMS: &[(&str, &[&str])] = &[
    (GENDER, &["MALE", "FEMALE"]),
    (ACTION_CATEGORY, &["IMPORT", "EXTRACTION", "ALIQUOTING", "MEASUREMENT", "PROCESSING"]),
    (VESSEL_CONTENT, &["EMPTY", "BLOOD", "SERUM", "DNA", "RNA"]),
    (DATA_SAMPLE_STATUS, &["USABLE", "UNUSABLE", "UNKNOWN", "INSUFFICIENT_QUALITY"]),
];

//-----------------------------------------------------------------------------

// Timestamps are stored with millisecond precision.
fn set_now_if_missing(conf: &mut Conf, name: &str) {
    if !conf.contains_key(name) {
        conf.insert(name.to_string(), Value::Timestamp(Utc::now().trunc_subsecs(3)));
    }
}

fn study_preprocess(conf: &mut Conf) {
    set_now_if_missing(conf, "start_date");
}

fn action_preprocess(conf: &mut Conf) {
    set_now_if_missing(conf, "start_time");
}

fn individual_validation(class: &'static EntityClass, failure: &ValidationFailure) -> KBError {
    if failure.missing.iter().any(|x| x == "gender") {
        return KBError::Validation(format!("{}: missing gender, the sex of an individual must be known", class.name));
    }
    default_validation_error(class, failure)
}

//-----------------------------------------------------------------------------

/// Root of the class tree.
pub static KB_OBJECT: EntityClass = EntityClass {
    name: "KBObject",
    parent: None,
    fields: &[Field::required("vid", FieldType::Vid)],
    unique_key: &[],
    preprocess: None,
    validation: None,
};

/// A study groups individuals and samples under a label.
pub static STUDY: EntityClass = EntityClass {
    name: "Study",
    parent: Some(&KB_OBJECT),
    fields: &[
        Field::required("label", FieldType::String),
        Field::optional("description", FieldType::String),
        Field::required("start_date", FieldType::Timestamp),
        Field::optional("end_date", FieldType::Timestamp),
    ],
    unique_key: &["label"],
    preprocess: Some(study_preprocess),
    validation: None,
};

/// An action that produced one or more results.
pub static ACTION: EntityClass = EntityClass {
    name: "Action",
    parent: Some(&KB_OBJECT),
    fields: &[
        Field::required("category", FieldType::Enum(ACTION_CATEGORY)),
        Field::optional("context", FieldType::Entity("Study")),
        Field::required("operator", FieldType::String),
        Field::required("start_time", FieldType::Timestamp),
        Field::optional("end_time", FieldType::Timestamp),
        Field::optional("description", FieldType::String),
    ],
    unique_key: &[],
    preprocess: Some(action_preprocess),
    validation: None,
};

/// A person with optional references to the parents.
pub static INDIVIDUAL: EntityClass = EntityClass {
    name: "Individual",
    parent: Some(&KB_OBJECT),
    fields: &[
        Field::required("gender", FieldType::Enum(GENDER)),
        Field::optional("father", FieldType::SelfRef),
        Field::optional("mother", FieldType::SelfRef),
        Field::optional("action", FieldType::Entity("Action")),
    ],
    unique_key: &[],
    preprocess: None,
    validation: Some(individual_validation),
};

/// Anything produced by an action.
pub static RESULT: EntityClass = EntityClass {
    name: "Result",
    parent: Some(&KB_OBJECT),
    fields: &[
        Field::required("action", FieldType::Entity("Action")),
        Field::optional("outcome", FieldType::String),
    ],
    unique_key: &[],
    preprocess: None,
    validation: None,
};

/// A physical sample.
pub static SAMPLE: EntityClass = EntityClass {
    name: "Sample",
    parent: Some(&RESULT),
    fields: &[
        Field::optional("label", FieldType::String),
    ],
    unique_key: &[],
    preprocess: None,
    validation: None,
};

/// A biological sample in a vessel.
pub static BIO_SAMPLE: EntityClass = EntityClass {
    name: "BioSample",
    parent: Some(&SAMPLE),
    fields: &[
        Field::optional("barcode", FieldType::String),
        Field::required("initial_volume", FieldType::Float),
        Field::required("current_volume", FieldType::Float),
        Field::required("content", FieldType::Enum(VESSEL_CONTENT)),
        Field::optional("individual", FieldType::Entity("Individual")),
    ],
    unique_key: &[],
    preprocess: None,
    validation: None,
};

/// A DNA extract.
pub static DNA_SAMPLE: EntityClass = EntityClass {
    name: "DNASample",
    parent: Some(&BIO_SAMPLE),
    fields: &[
        Field::optional("nanodrop_concentration", FieldType::Float),
        Field::optional("qp230260", FieldType::Float),
        Field::optional("qp230280", FieldType::Float),
    ],
    unique_key: &[],
    preprocess: None,
    validation: None,
};

/// A data set produced by a measurement.
pub static DATA_SAMPLE: EntityClass = EntityClass {
    name: "DataSample",
    parent: Some(&RESULT),
    fields: &[
        Field::required("label", FieldType::String),
        Field::required("status", FieldType::Enum(DATA_SAMPLE_STATUS)),
        Field::optional("sample", FieldType::Entity("Sample")),
    ],
    unique_key: &["label"],
    preprocess: None,
    validation: None,
};

/// A data sample whose genotype calls are stored as a GDO.
pub static GENOTYPE_DATA_SAMPLE: EntityClass = EntityClass {
    name: "GenotypeDataSample",
    parent: Some(&DATA_SAMPLE),
    fields: &[
        Field::required("markers_set_vid", FieldType::Vid),
        Field::required("gdo_vid", FieldType::Vid),
        Field::optional("individual", FieldType::Entity("Individual")),
    ],
    unique_key: &[],
    preprocess: None,
    validation: None,
};

/// All entity classes.
pub static CLASSES: &[&EntityClass] = &[
    &KB_OBJECT, &STUDY, &ACTION, &INDIVIDUAL, &RESULT, &SAMPLE,
    &BIO_SAMPLE, &DNA_SAMPLE, &DATA_SAMPLE, &GENOTYPE_DATA_SAMPLE,
];

/// Returns the entity class with the given name.
pub fn class_by_name(name: &str) -> Option<&'static EntityClass> {
    CLASSES.iter().copied().find(|x| x.name == name)
}

//-----------------------------------------------------------------------------
