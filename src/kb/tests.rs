use super::*;

use crate::internal;
use crate::markers::{Allele, Strand};
use crate::vid;

use rand::Rng;

//-----------------------------------------------------------------------------

const OP_VID: &str = "V1";
const MAKER: &str = "foomatic";
const MODEL: &str = "barfoo";

fn add_definitions(kb: &KnowledgeBase, n: usize) -> Vec<String> {
    let vids = kb.add_snp_marker_definitions(internal::example_definitions(n), OP_VID, 4);
    assert!(vids.is_ok(), "Failed to add definitions: {}", vids.unwrap_err());
    let vids = vids.unwrap();
    assert_eq!(vids.len(), n, "Wrong number of marker VIDs");
    vids
}

fn members(vids: &[String]) -> Vec<SetMember> {
    vids.iter().enumerate().map(|(i, vid)| SetMember {
        marker_vid: vid.clone(),
        marker_indx: i,
        allele_flip: false,
    }).collect()
}

fn create_set(kb: &KnowledgeBase, maker: &str, model: &str, members: Vec<SetMember>) -> String {
    let set_vid = kb.create_snp_markers_set(maker, model, members, OP_VID, 3);
    assert!(set_vid.is_ok(), "Failed to create markers set {}/{}: {}", maker, model, set_vid.unwrap_err());
    set_vid.unwrap()
}

fn random_gdo(n: usize) -> (Array2<f32>, Array1<f32>) {
    let mut rng = rand::thread_rng();
    let probs = Array2::from_shape_fn((2, n), |(i, _)| {
        let center = if i == 0 { 0.09 } else { 0.49 };
        center + rng.gen_range(-0.05..0.05)
    });
    let confs = Array1::from_shape_fn(n, |_| 0.5 + rng.gen_range(-0.1..0.1));
    (probs, confs)
}

fn append_gdo(kb: &KnowledgeBase, set_vid: &str, probs: &Array2<f32>, confs: &Array1<f32>) -> String {
    let gdo_vid = kb.append_gdo(set_vid, probs, confs, OP_VID);
    assert!(gdo_vid.is_ok(), "Failed to append a GDO: {}", gdo_vid.unwrap_err());
    gdo_vid.unwrap()
}

fn conf(values: &[(&str, Value)]) -> Conf {
    values.iter().map(|(name, value)| (name.to_string(), value.clone())).collect()
}

fn stored(kb: &KnowledgeBase, class: &'static EntityClass, values: &[(&str, Value)]) -> Entity {
    let entity = kb.new_entity(class, conf(values));
    assert!(entity.is_ok(), "Failed to create {}: {}", class, entity.unwrap_err());
    let mut entity = entity.unwrap();
    let result = kb.save(&mut entity);
    assert!(result.is_ok(), "Failed to save {}: {}", class, result.unwrap_err());
    entity
}

fn import_action(kb: &KnowledgeBase) -> Entity {
    stored(kb, &model::ACTION, &[
        ("category", Value::Enum(String::from("IMPORT"))),
        ("operator", Value::from("alice")),
    ])
}

fn individual(kb: &KnowledgeBase, gender: &str) -> Entity {
    stored(kb, &model::INDIVIDUAL, &[("gender", Value::Enum(gender.to_string()))])
}

//-----------------------------------------------------------------------------

#[test]
fn lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let config = internal::create_config(&dir);
    let kb = KnowledgeBase::create(&config);
    assert!(kb.is_ok(), "Failed to create a knowledge base: {}", kb.unwrap_err());
    let kb = kb.unwrap();
    let vids = add_definitions(&kb, 3);
    assert_eq!(kb.params().batch_size, KBParams::BATCH_SIZE);
    drop(kb);

    assert!(KnowledgeBase::create(&config).is_err(), "Created a knowledge base over an existing one");

    let kb = KnowledgeBase::open(&config);
    assert!(kb.is_ok(), "Failed to open the knowledge base: {}", kb.unwrap_err());
    let mut kb = kb.unwrap();
    assert_eq!(kb.enums().len(), model::ENUMS.iter().map(|(_, values)| values.len()).sum::<usize>());
    let markers = kb.get_snp_markers(&vids).unwrap();
    assert_eq!(markers.len(), 3);

    kb.set_params(KBParams { batch_size: 2 });
    assert_eq!(kb.params().batch_size, 2);
    assert_eq!(kb.get_snp_markers(&vids).unwrap(), markers, "Results depend on the batch size");

    let wrong = KBConfig::new(config.host.clone(), internal::USER, "hunter2");
    assert!(matches!(KnowledgeBase::open(&wrong), Err(KBError::Authentication(_))));
    let missing = KBConfig::new(dir.path().join("missing.db"), internal::USER, internal::PASSWORD);
    assert!(KnowledgeBase::open(&missing).is_err(), "Opened a missing knowledge base");
}

#[test]
fn tiny_set() {
    let (_dir, kb) = internal::create_kb();
    let n = 10;
    let vids = add_definitions(&kb, n);
    let set_vid = create_set(&kb, MAKER, MODEL, members(&vids));

    // The repository was provisioned with the set.
    assert_eq!(kb.gdo_count(&set_vid).unwrap(), 0);
    assert!(kb.create_gdo_repository(&set_vid, n).is_err(), "Provisioned the repository twice");

    let mut written = Vec::new();
    for _ in 0..10 {
        let (probs, confs) = random_gdo(n);
        written.push((append_gdo(&kb, &set_vid, &probs, &confs), probs, confs));
    }
    assert_eq!(kb.gdo_count(&set_vid).unwrap(), 10);

    let stream = kb.get_gdo_stream(&set_vid, 4);
    assert!(stream.is_ok(), "Failed to open a GDO stream: {}", stream.unwrap_err());
    let gdos: Vec<Gdo> = stream.unwrap().map(|x| x.unwrap()).collect();
    assert_eq!(gdos.len(), written.len());
    for (i, (gdo, (gdo_vid, probs, confs))) in gdos.iter().zip(written.iter()).enumerate() {
        assert_eq!(gdo.vid, *gdo_vid, "Wrong GDO at position {}", i);
        assert_eq!(gdo.probs.dim(), (2, n));
        assert_eq!(gdo.confs.len(), n);
        assert_eq!(gdo.probs, *probs, "Wrong probabilities at position {}", i);
        assert_eq!(gdo.confs, *confs, "Wrong confidences at position {}", i);
    }
    assert_eq!(kb.gateway().open_sessions(), 0);
}

#[test]
fn truncated_probabilities() {
    let (_dir, kb) = internal::create_kb();
    let n = 10;
    let vids = add_definitions(&kb, n);
    let set_vid = create_set(&kb, MAKER, MODEL, members(&vids));

    let (mut probs, mut confs) = random_gdo(n);
    for j in (n - 4)..n {
        probs[[0, j]] = 0.0;
        probs[[1, j]] = 0.0;
        confs[j] = 0.0;
    }
    let gdo_vid = append_gdo(&kb, &set_vid, &probs, &confs);

    let gdo = kb.get_gdo(&set_vid, &gdo_vid).unwrap();
    assert_eq!(gdo.probs.dim(), (2, n));
    assert_eq!(gdo.confs.len(), n);
    for j in (n - 4)..n {
        assert_eq!(gdo.probs[[0, j]], 0.0);
        assert_eq!(gdo.probs[[1, j]], 0.0);
        assert_eq!(gdo.confs[j], 0.0);
    }
    assert_eq!(gdo.probs, probs);
    assert_eq!(gdo.confs, confs);
}

#[test]
fn definition_selectors() {
    let (_dir, kb) = internal::create_kb();
    let vids = add_definitions(&kb, 10);

    let all = kb.get_snp_marker_definitions(None, 3).unwrap();
    assert_eq!(all.len(), 10);
    let selected = kb.get_snp_marker_definitions(Some("(op_vid==\"V1\")"), 3).unwrap();
    assert_eq!(selected.len(), 10);
    assert_eq!(selected.iter().map(|x| x.vid.clone()).collect::<Vec<String>>(), vids);
    let none = kb.get_snp_marker_definitions(Some("(source==\"src-NONEXISTENT\")"), 3).unwrap();
    assert!(none.is_empty());

    let one = kb.get_snp_marker_definitions(Some("label == \"foo-000004\""), 3).unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].vid, vids[4]);
    assert_eq!(one[0].rs_label, "rs1004");

    assert!(matches!(kb.get_snp_marker_definitions(Some("(op_vid=="), 3), Err(KBError::Selector(_))));
    assert!(matches!(kb.get_snp_marker_definitions(Some("colour == \"red\""), 3), Err(KBError::Selector(_))));

    // Definitions by VID in the requested order.
    let requested = vec![vids[7].clone(), vids[2].clone(), vids[7].clone()];
    let markers = kb.get_snp_markers(&requested).unwrap();
    let labels: Vec<&str> = markers.iter().map(|x| x.label.as_str()).collect();
    assert_eq!(labels, vec!["foo-000007", "foo-000002", "foo-000007"]);
    assert!(matches!(kb.get_snp_markers(&[vid::make_vid()]), Err(KBError::NotFound(_))));
}

#[test]
fn alignments() {
    let (_dir, kb) = internal::create_kb();
    let vids = add_definitions(&kb, 5);
    let alignments: Vec<SnpAlignment> = vids.iter().enumerate().map(|(i, vid)| {
        let strand = if i % 2 == 0 { Strand::Forward } else { Strand::Reverse };
        SnpAlignment::new(vid, "hg19", 1 + i as i64, 1000 * (i as i64 + 1), strand, Allele::A, 1).unwrap()
    }).collect();
    assert_eq!(kb.add_snp_alignments(alignments.clone(), OP_VID, 2).unwrap(), 5);

    // A second alignment for the same marker under the same operation.
    let extra = SnpAlignment::new(&vids[0], "hg19", 23, 42, Strand::Reverse, Allele::B, 2).unwrap();
    assert_eq!(kb.add_snp_alignments(vec![extra.clone()], OP_VID, 2).unwrap(), 1);

    let stored = kb.get_snp_alignments(None, 4).unwrap();
    assert_eq!(stored.len(), 6);
    for (row, truth) in stored.iter().zip(alignments.iter().chain(std::iter::once(&extra))) {
        assert_eq!(row.alignment, *truth);
        assert_eq!(row.op_vid, OP_VID);
    }
    assert_eq!(stored[5].alignment.global_pos, 23 * SnpAlignment::CHROMOSOME_OFFSET + 42);

    let on_x = kb.get_snp_alignments(Some("chromosome == 23"), 4).unwrap();
    assert_eq!(on_x.len(), 1);
    assert_eq!(on_x[0].alignment.marker_vid, vids[0]);

    let mut broken = alignments[1].clone();
    broken.global_pos += 1;
    assert!(matches!(kb.add_snp_alignments(vec![broken], OP_VID, 2), Err(KBError::Validation(_))));
    assert!(SnpAlignment::new(&vids[0], "hg19", 25, 1, Strand::Forward, Allele::A, 1).is_err());
    assert_eq!(kb.get_snp_alignments(None, 4).unwrap().len(), 6, "A rejected alignment was stored");
}

#[test]
fn duplicate_set() {
    let (_dir, kb) = internal::create_kb();
    let vids = add_definitions(&kb, 10);
    let set_vid = create_set(&kb, MAKER, MODEL, members(&vids));
    assert_eq!(kb.get_snp_marker_set_vid(MAKER, MODEL).unwrap(), set_vid);
    assert!(vid::is_vid(&set_vid));

    let result = kb.create_snp_markers_set(MAKER, MODEL, members(&vids), OP_VID, 3);
    assert!(matches!(result, Err(KBError::Validation(_))), "Created a duplicate markers set");
    let sets = kb.get_snp_markers_sets(None).unwrap();
    assert_eq!(sets.len(), 1, "A refused markers set was written");
    assert_eq!(sets[0].vid, set_vid);
    assert_eq!(sets[0].maker, MAKER);
    assert_eq!(sets[0].model, MODEL);
    assert_eq!(sets[0].op_vid, OP_VID);

    // Another model by the same maker is fine.
    let other = create_set(&kb, MAKER, "bazfoo", members(&vids[..4]));
    assert_ne!(other, set_vid);
    assert_eq!(kb.get_snp_markers_sets(Some(&format!("maker == \"{}\"", MAKER))).unwrap().len(), 2);
    assert_eq!(kb.gdo_count(&other).unwrap(), 0);

    assert!(matches!(kb.get_snp_marker_set_vid(MAKER, "nothing"), Err(KBError::NotFound(_))));
    assert!(matches!(kb.get_snp_marker_set_vid("\"", MODEL), Err(KBError::Validation(_))));
}

#[test]
fn set_validation() {
    let (_dir, kb) = internal::create_kb();
    let vids = add_definitions(&kb, 5);

    let empty: Vec<SetMember> = Vec::new();
    assert!(matches!(kb.create_snp_markers_set(MAKER, "empty", empty, OP_VID, 3), Err(KBError::Validation(_))));

    let mut unknown = members(&vids);
    unknown[2].marker_vid = vid::make_vid();
    assert!(matches!(kb.create_snp_markers_set(MAKER, "unknown", unknown, OP_VID, 3), Err(KBError::Validation(_))));

    let mut gap = members(&vids);
    gap[4].marker_indx = 5;
    assert!(matches!(kb.create_snp_markers_set(MAKER, "gap", gap, OP_VID, 3), Err(KBError::Validation(_))));

    let mut repeated = members(&vids);
    repeated[3].marker_indx = 1;
    assert!(matches!(kb.create_snp_markers_set(MAKER, "repeated", repeated, OP_VID, 3), Err(KBError::Validation(_))));

    assert!(kb.get_snp_markers_sets(None).unwrap().is_empty(), "A refused markers set was written");
    assert_eq!(kb.gateway().open_sessions(), 0);
}

#[test]
fn set_content() {
    let (_dir, kb) = internal::create_kb();
    let vids = add_definitions(&kb, 6);

    // Members in reverse order, with every other allele flipped.
    let content: Vec<SetMember> = vids.iter().enumerate().rev().map(|(i, vid)| SetMember {
        marker_vid: vid.clone(),
        marker_indx: vids.len() - 1 - i,
        allele_flip: i % 2 == 1,
    }).collect();
    let set_vid = create_set(&kb, MAKER, MODEL, content);
    let other = create_set(&kb, MAKER, "other", members(&vids[..2]));

    let stored = kb.get_snp_markers_set_content(&set_vid).unwrap();
    assert_eq!(stored.len(), vids.len());
    for (indx, row) in stored.iter().enumerate() {
        let i = vids.len() - 1 - indx;
        assert_eq!(row.set_vid, set_vid);
        assert_eq!(row.member.marker_indx, indx, "Members are not in index order");
        assert_eq!(row.member.marker_vid, vids[i]);
        assert_eq!(row.member.allele_flip, i % 2 == 1);
        assert_eq!(row.op_vid, OP_VID);
    }
    assert_eq!(kb.get_snp_markers_set_content(&other).unwrap().len(), 2);
    assert!(kb.get_snp_markers_set_content(&vid::make_vid()).unwrap().is_empty());

    // Markers in set order.
    let ordered: Vec<String> = stored.iter().map(|x| x.member.marker_vid.clone()).collect();
    let markers = kb.get_snp_markers(&ordered).unwrap();
    assert_eq!(markers[0].label, "foo-000005");
    assert_eq!(markers[5].label, "foo-000000");
}

#[test]
fn failed_ingest_releases_session() {
    let (_dir, kb) = internal::create_kb();
    let mut definitions = internal::example_definitions(10);
    definitions[7].label = String::from("a-label-that-does-not-fit-in-the-column");

    let result = kb.add_snp_marker_definitions(definitions, OP_VID, 5);
    assert!(result.is_err(), "Stored a label wider than the column");
    assert_eq!(kb.gateway().open_sessions(), 0, "The failed ingest left its session open");

    let opened = kb.gateway().sessions_opened();
    let vids = add_definitions(&kb, 3);
    assert_eq!(vids.len(), 3);
    assert!(kb.gateway().sessions_opened() > opened, "The next ingest did not use a fresh session");
    assert_eq!(kb.gateway().open_sessions(), 0);
}

#[test]
fn objects() {
    let (_dir, kb) = internal::create_kb();
    let action = import_action(&kb);
    let father = individual(&kb, "MALE");
    let mother = individual(&kb, "FEMALE");
    let mut child = kb.new_entity(&model::INDIVIDUAL, conf(&[
        ("gender", Value::Enum(String::from("FEMALE"))),
        ("father", Value::reference(&father)),
        ("mother", Value::reference(&mother)),
        ("action", Value::reference(&action)),
    ])).unwrap();
    kb.save(&mut child).unwrap();

    let loaded = kb.get_by_vid(&model::INDIVIDUAL, child.vid()).unwrap();
    assert_eq!(loaded.get_ref("father").map(|x| x.vid.as_str()), Some(father.vid()));
    assert_eq!(loaded.get("gender"), Some(&Value::Enum(String::from("FEMALE"))));
    assert!(loaded.is_persisted());
    assert!(matches!(kb.get_by_vid(&model::STUDY, child.vid()), Err(KBError::NotFound(_))));
    assert!(matches!(kb.get_by_vid(&model::INDIVIDUAL, &vid::make_vid()), Err(KBError::NotFound(_))));

    let individuals = kb.get_objects(&model::INDIVIDUAL).unwrap();
    assert_eq!(individuals.len(), 3);
    let females = kb.find_objects(&model::INDIVIDUAL, "gender", &Value::Enum(String::from("FEMALE"))).unwrap();
    assert_eq!(females.len(), 2);
    let children = kb.find_objects(&model::INDIVIDUAL, "father", &Value::reference(&father)).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].vid(), child.vid());
    assert!(matches!(kb.find_objects(&model::INDIVIDUAL, "height", &Value::from(1.8)), Err(KBError::Validation(_))));

    // Polymorphic queries.
    let sample = stored(&kb, &model::DNA_SAMPLE, &[
        ("action", Value::reference(&action)),
        ("initial_volume", Value::from(10.0)),
        ("current_volume", Value::from(8.5)),
        ("content", Value::Enum(String::from("DNA"))),
        ("individual", Value::reference(&child)),
    ]);
    let samples = kb.get_objects(&model::SAMPLE).unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].class().name, "DNASample");
    assert_eq!(samples[0].get_float("current_volume"), Some(8.5));
    assert_eq!(kb.get_objects(&model::RESULT).unwrap().len(), 1);
    assert!(kb.get_objects(&model::DATA_SAMPLE).unwrap().is_empty());

    let mut changed = kb.get_by_vid(&model::BIO_SAMPLE, sample.vid()).unwrap();
    changed.set("current_volume", 7.0).unwrap();
    kb.save(&mut changed).unwrap();
    let mut original = sample.clone();
    kb.reload(&mut original).unwrap();
    assert_eq!(original.get_float("current_volume"), Some(7.0));

    assert!(kb.delete(&sample).unwrap());
    assert!(!kb.delete(&sample).unwrap());
    assert!(kb.get_objects(&model::SAMPLE).unwrap().is_empty());

    // Unique keys are enforced through the validation hooks.
    let _ = stored(&kb, &model::STUDY, &[("label", Value::from("study-1"))]);
    let mut again = kb.new_entity(&model::STUDY, conf(&[("label", Value::from("study-1"))])).unwrap();
    assert!(matches!(kb.save(&mut again), Err(KBError::Validation(_))));
}

#[test]
fn enumerations() {
    let (_dir, kb) = internal::create_kb();
    assert_eq!(kb.get_enum_values(model::GENDER).unwrap(), vec!["MALE", "FEMALE"]);
    let statuses = kb.get_enum_values(model::DATA_SAMPLE_STATUS).unwrap();
    assert!(statuses.contains(&String::from("USABLE")));
    assert!(matches!(kb.get_enum_values("Colour"), Err(KBError::NotFound(_))));

    let result = kb.new_entity(&model::INDIVIDUAL, conf(&[("gender", Value::Enum(String::from("OTHER")))]));
    let saved = result.and_then(|mut x| kb.save(&mut x));
    assert!(saved.is_err(), "Saved an individual with an unknown gender");
}

#[test]
fn genotype_data_samples() {
    let (_dir, kb) = internal::create_kb();
    let n = 5;
    let vids = add_definitions(&kb, n);
    let set_vid = create_set(&kb, MAKER, MODEL, members(&vids));
    let action = import_action(&kb);
    let person = individual(&kb, "MALE");

    let mut written = Vec::new();
    let mut samples = Vec::new();
    for i in 0..3 {
        let (probs, confs) = random_gdo(n);
        let gdo_vid = append_gdo(&kb, &set_vid, &probs, &confs);
        let owner = if i == 0 { Some(&person) } else { None };
        let sample = kb.register_genotype_data_sample(&action, &format!("gds-{}", i), &set_vid, &gdo_vid, owner);
        assert!(sample.is_ok(), "Failed to register sample {}: {}", i, sample.unwrap_err());
        samples.push(sample.unwrap());
        written.push((gdo_vid, probs));
    }

    let loaded = kb.get_objects(&model::GENOTYPE_DATA_SAMPLE).unwrap();
    assert_eq!(loaded.len(), 3);
    let first = kb.get_by_vid(&model::DATA_SAMPLE, samples[0].vid()).unwrap();
    assert_eq!(first.get("status"), Some(&Value::Enum(String::from("USABLE"))));
    assert_eq!(first.get_ref("individual").map(|x| x.vid.as_str()), Some(person.vid()));
    assert_eq!(first.get_str("markers_set_vid"), Some(set_vid.as_str()));

    // GDOs come back in the order of the samples.
    let reversed: Vec<Entity> = samples.iter().rev().cloned().collect();
    let gdos = kb.get_gdos_for_samples(&reversed).unwrap();
    for (gdo, (gdo_vid, probs)) in gdos.iter().zip(written.iter().rev()) {
        assert_eq!(gdo.vid, *gdo_vid);
        assert_eq!(gdo.probs, *probs);
    }

    assert!(kb.register_genotype_data_sample(&action, "gds-missing", &set_vid, &vid::make_vid(), None).is_err());
    assert!(kb.register_genotype_data_sample(&action, "gds-0", &set_vid, &written[1].0, None).is_err(), "Registered a duplicate label");
    assert!(matches!(kb.get_gdos_for_samples(&[person]), Err(KBError::Validation(_))));
}

#[test]
fn dropped_repository() {
    let (_dir, kb) = internal::create_kb();
    let vids = add_definitions(&kb, 4);
    let set_vid = create_set(&kb, MAKER, MODEL, members(&vids));
    let (probs, confs) = random_gdo(4);
    let gdo_vid = append_gdo(&kb, &set_vid, &probs, &confs);

    assert!(kb.drop_gdo_repository(&set_vid).unwrap());
    assert!(!kb.drop_gdo_repository(&set_vid).unwrap());
    assert!(matches!(kb.get_gdo(&set_vid, &gdo_vid), Err(KBError::MissingTable(_))));
    assert!(matches!(kb.gdo_count(&set_vid), Err(KBError::MissingTable(_))));

    // The set itself survives and can get a fresh repository.
    assert_eq!(kb.get_snp_marker_set_vid(MAKER, MODEL).unwrap(), set_vid);
    kb.create_gdo_repository(&set_vid, 4).unwrap();
    assert_eq!(kb.gdo_count(&set_vid).unwrap(), 0);
    assert!(matches!(kb.get_gdo(&set_vid, &gdo_vid), Err(KBError::NotFound(_))), "A GDO survived the drop");
    let (probs, confs) = random_gdo(4);
    let fresh = append_gdo(&kb, &set_vid, &probs, &confs);
    assert_eq!(kb.gdo_count(&set_vid).unwrap(), 1);
    assert_eq!(kb.get_gdo(&set_vid, &fresh).unwrap().probs, probs);
}

//-----------------------------------------------------------------------------
