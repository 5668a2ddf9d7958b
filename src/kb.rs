//! Knowledge-base facade.
//!
//! [`KnowledgeBase`] combines the object wrapper layer, the marker tables, and the GDO repositories behind one API.
//! Every method runs its backend work in fresh short-lived sessions through the [`Gateway`].

use crate::backend::{Gateway, Request, Selector, ServiceKind};
use crate::gdo::{Gdo, GdoRepository, GdoStream};
use crate::markers::{self, SetMember, SetMemberRow, SnpAlignment, SnpAlignmentRow, SnpDefinition, SnpMarker, SnpMarkersSet, VidPolicy};
use crate::objects::{model, Conf, EntityClass, Entity, EnumCache, Value};
use crate::schema;
use crate::{KBConfig, KBError, KBParams, Result};

use ndarray::{Array1, Array2};

use tracing::{info, warn};

#[cfg(test)]
mod tests;

//-----------------------------------------------------------------------------

/// A knowledge base for SNP genotyping data.
///
/// # Examples
///
/// ```
/// use genokb::{KBConfig, KnowledgeBase};
/// use genokb::markers::{SetMember, SnpDefinition};
///
/// let dir = tempfile::tempdir().unwrap();
/// let config = KBConfig::new(dir.path().join("kb.db"), "root", "secret");
/// let kb = KnowledgeBase::create(&config).unwrap();
///
/// let definitions: Vec<SnpDefinition> = (0..3).map(|i| SnpDefinition {
///     source: String::from("example"),
///     context: String::from("doc"),
///     label: format!("snp-{}", i),
///     rs_label: format!("rs{}", i),
///     mask: String::from("ACGT[A/G]TTGA"),
/// }).collect();
/// let vids = kb.add_snp_marker_definitions(definitions, "V1", 1000).unwrap();
/// assert_eq!(vids.len(), 3);
///
/// let members = vids.iter().enumerate().map(|(i, vid)| SetMember {
///     marker_vid: vid.clone(), marker_indx: i, allele_flip: false,
/// });
/// let set_vid = kb.create_snp_markers_set("maker", "model", members, "V1", 1000).unwrap();
/// assert_eq!(kb.get_snp_marker_set_vid("maker", "model").unwrap(), set_vid);
/// assert_eq!(kb.gdo_count(&set_vid).unwrap(), 0);
/// ```
#[derive(Debug)]
pub struct KnowledgeBase {
    gateway: Gateway,
    enums: EnumCache,
    gdos: GdoRepository,
    params: KBParams,
}

impl KnowledgeBase {
    /// Creates a new knowledge base.
    ///
    /// Creates the backend database, seeds the enumerations, and provisions the marker tables.
    /// Fails if the database already exists.
    pub fn create(config: &KBConfig) -> Result<Self> {
        let gateway = Gateway::create_with(config, Self::initialize)?;
        info!(
            "Created knowledge base {} ({})",
            config.host.display(), gateway.file_size().unwrap_or(String::from("unknown size"))
        );
        Self::from_gateway(gateway)
    }

    // Seeds the enumerations and provisions the marker tables.
    fn initialize(gateway: &Gateway) -> Result<()> {
        for (class, values) in model::ENUMS.iter() {
            let request = Request::RegisterEnum {
                class: class.to_string(),
                values: values.iter().map(|x| x.to_string()).collect(),
            };
            gateway.perform(ServiceKind::Update, request)?;
        }
        let created = gateway.with_tables(schema::create_marker_tables)?;
        info!("Provisioned {} marker tables", created);
        Ok(())
    }

    /// Opens an existing knowledge base.
    ///
    /// Authenticates and loads the enumerations.
    pub fn open(config: &KBConfig) -> Result<Self> {
        let gateway = Gateway::open(config)?;
        Self::from_gateway(gateway)
    }

    fn from_gateway(gateway: Gateway) -> Result<Self> {
        let enums = EnumCache::load(&gateway)?;
        if enums.is_empty() {
            warn!("Knowledge base {} has no enumerations", gateway.config().host.display());
        }
        Ok(KnowledgeBase {
            gateway,
            enums,
            gdos: GdoRepository::new(),
            params: KBParams::default(),
        })
    }

    /// Replaces the default parameters.
    pub fn set_params(&mut self, params: KBParams) {
        self.params = params;
    }

    /// Returns the parameters.
    pub fn params(&self) -> &KBParams {
        &self.params
    }

    /// Returns the backend gateway.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Returns the enumeration cache.
    pub fn enums(&self) -> &EnumCache {
        &self.enums
    }
}

//-----------------------------------------------------------------------------

/// Entities.
impl KnowledgeBase {
    /// Stages a new entity of the class.
    pub fn new_entity(&self, class: &'static EntityClass, conf: Conf) -> Result<Entity> {
        Entity::create(class, conf)
    }

    /// Saves the entity.
    pub fn save(&self, entity: &mut Entity) -> Result<()> {
        entity.save(&self.gateway, &self.enums)
    }

    /// Replaces the values of the entity with the stored ones.
    pub fn reload(&self, entity: &mut Entity) -> Result<()> {
        entity.reload(&self.gateway, &self.enums)
    }

    /// Returns the entity with the given VID.
    ///
    /// Fails if there is no such entity or it is not an instance of the class.
    pub fn get_by_vid(&self, class: &'static EntityClass, vid: &str) -> Result<Entity> {
        let record = self.gateway.perform(ServiceKind::Query, Request::GetObject { vid: vid.to_string() })?.into_object()?;
        let record = record.ok_or_else(|| KBError::NotFound(format!("no {} with VID {}", class.name, vid)))?;
        let entity = Entity::from_record(&record, &self.enums)?;
        if !entity.class().is_a(class.name) {
            return Err(KBError::NotFound(format!("object {} is a {}, not a {}", vid, entity.class().name, class.name)));
        }
        Ok(entity)
    }

    /// Returns all entities of the class and its subclasses in VID order.
    pub fn get_objects(&self, class: &'static EntityClass) -> Result<Vec<Entity>> {
        let request = Request::FindObjects { class: class.name.to_string(), field: None };
        self.entities(request)
    }

    /// Returns the entities of the class and its subclasses with `field == value`.
    pub fn find_objects(&self, class: &'static EntityClass, field: &str, value: &Value) -> Result<Vec<Entity>> {
        let (declaration, _) = class.field(field).ok_or_else(|| {
            KBError::Validation(format!("{}: unknown field {}", class.name, field))
        })?;
        let wrapped = value.wrap(&self.enums, declaration.ftype)?;
        let request = Request::FindObjects { class: class.name.to_string(), field: Some((field.to_string(), wrapped)) };
        self.entities(request)
    }

    fn entities(&self, request: Request) -> Result<Vec<Entity>> {
        let records = self.gateway.perform(ServiceKind::Query, request)?.into_objects()?;
        records.iter().map(|x| Entity::from_record(x, &self.enums)).collect()
    }

    /// Deletes the entity and returns `true` if it was stored.
    pub fn delete(&self, entity: &Entity) -> Result<bool> {
        self.gateway.perform(ServiceKind::Update, Request::DeleteObject { vid: entity.vid().to_string() })?.into_deleted()
    }

    /// Returns the values of the named enumeration.
    pub fn get_enum_values(&self, name: &str) -> Result<Vec<String>> {
        let values = self.enums.values(name);
        if values.is_empty() {
            return Err(KBError::NotFound(format!("unknown enumeration {}", name)));
        }
        Ok(values)
    }
}

//-----------------------------------------------------------------------------

fn parse_selector(selector: Option<&str>) -> Result<Option<Selector>> {
    selector.map(Selector::parse).transpose()
}

fn quoted(field: &str, value: &str) -> Result<String> {
    if value.contains('"') {
        return Err(KBError::Validation(format!("{} {:?} cannot contain double quotes", field, value)));
    }
    Ok(format!("\"{}\"", value))
}

/// SNP markers and markers sets.
impl KnowledgeBase {
    /// Appends marker definitions and returns their fresh VIDs in input order.
    pub fn add_snp_marker_definitions<I>(&self, definitions: I, op_vid: &str, batch_size: usize) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = SnpDefinition>,
    {
        let report = markers::extend(&self.gateway, definitions, VidPolicy::Fresh, op_vid, batch_size)?;
        Ok(report.vids)
    }

    /// Appends marker alignments and returns the number of appended rows.
    pub fn add_snp_alignments<I>(&self, alignments: I, op_vid: &str, batch_size: usize) -> Result<usize>
    where
        I: IntoIterator<Item = SnpAlignment>,
    {
        let report = markers::extend(&self.gateway, alignments, VidPolicy::None, op_vid, batch_size)?;
        Ok(report.rows)
    }

    /// Creates a markers set and returns its VID.
    ///
    /// Writes the set descriptor, then the members, and finally provisions the GDO repository for the set.
    /// Fails before writing anything if the (maker, model) pair already has a set,
    /// if a member refers to an unknown marker, or if the member indices are not exactly `0..N`.
    pub fn create_snp_markers_set<I>(&self, maker: &str, model: &str, members: I, op_vid: &str, batch_size: usize) -> Result<String>
    where
        I: IntoIterator<Item = SetMember>,
    {
        match self.get_snp_marker_set_vid(maker, model) {
            Ok(set_vid) => {
                return Err(KBError::Validation(format!("markers set {}/{} already exists as {}", maker, model, set_vid)));
            },
            Err(KBError::NotFound(_)) => {},
            Err(err) => return Err(err),
        }

        let members: Vec<SetMember> = members.into_iter().collect();
        if members.is_empty() {
            return Err(KBError::Validation(format!("markers set {}/{} has no members", maker, model)));
        }
        let mut seen = vec![false; members.len()];
        for member in members.iter() {
            if member.marker_indx >= members.len() || seen[member.marker_indx] {
                return Err(KBError::Validation(format!(
                    "markers set {}/{}: marker indices must be a permutation of 0..{}, found {}",
                    maker, model, members.len(), member.marker_indx
                )));
            }
            seen[member.marker_indx] = true;
        }
        let known = markers::marker_vids(&self.gateway, self.params.batch_size)?;
        if let Some(member) = members.iter().find(|x| !known.contains(&x.marker_vid)) {
            return Err(KBError::Validation(format!(
                "markers set {}/{}: member {} refers to unknown marker {}",
                maker, model, member.marker_indx, member.marker_vid
            )));
        }

        let n = members.len();
        let descriptor = vec![(maker.to_string(), model.to_string())];
        let report = markers::extend(&self.gateway, descriptor, VidPolicy::Fresh, op_vid, batch_size)?;
        let set_vid = report.vids.into_iter().next().ok_or_else(|| {
            KBError::Invariant(format!("no VID assigned to markers set {}/{}", maker, model))
        })?;
        markers::extend(&self.gateway, members, VidPolicy::Fixed(&set_vid), op_vid, batch_size)?;
        self.gdos.create_repository(&self.gateway, &set_vid, n)?;
        info!("Created markers set {}/{} with {} markers as {}", maker, model, n, set_vid);
        Ok(set_vid)
    }

    /// Returns the VID of the markers set for the (maker, model) pair.
    ///
    /// Fails with [`KBError::NotFound`] if there is no such set and with [`KBError::Invariant`] if there are several.
    pub fn get_snp_marker_set_vid(&self, maker: &str, model: &str) -> Result<String> {
        let source = format!("(maker == {}) & (model == {})", quoted("maker", maker)?, quoted("model", model)?);
        let selector = Selector::parse(&source)?;
        let sets: Vec<SnpMarkersSet> = markers::read(&self.gateway, Some(&selector), self.params.batch_size)?;
        match sets.len() {
            0 => Err(KBError::NotFound(format!("no markers set for {}/{}", maker, model))),
            1 => Ok(sets[0].vid.clone()),
            n => Err(KBError::Invariant(format!("{} markers sets for {}/{}", n, maker, model))),
        }
    }

    /// Returns the marker definitions, optionally filtered by a selector.
    pub fn get_snp_marker_definitions(&self, selector: Option<&str>, batch_size: usize) -> Result<Vec<SnpMarker>> {
        let selector = parse_selector(selector)?;
        markers::read(&self.gateway, selector.as_ref(), batch_size)
    }

    /// Returns the marker alignments, optionally filtered by a selector.
    pub fn get_snp_alignments(&self, selector: Option<&str>, batch_size: usize) -> Result<Vec<SnpAlignmentRow>> {
        let selector = parse_selector(selector)?;
        markers::read(&self.gateway, selector.as_ref(), batch_size)
    }

    /// Returns the markers set descriptors, optionally filtered by a selector.
    pub fn get_snp_markers_sets(&self, selector: Option<&str>) -> Result<Vec<SnpMarkersSet>> {
        let selector = parse_selector(selector)?;
        markers::read(&self.gateway, selector.as_ref(), self.params.batch_size)
    }

    /// Returns the members of the markers set ordered by marker index.
    pub fn get_snp_markers_set_content(&self, set_vid: &str) -> Result<Vec<SetMemberRow>> {
        let selector = Selector::parse(&format!("vid == {}", quoted("set VID", set_vid)?))?;
        let mut members: Vec<SetMemberRow> = markers::read(&self.gateway, Some(&selector), self.params.batch_size)?;
        members.sort_by_key(|x| x.member.marker_indx);
        Ok(members)
    }

    /// Returns the marker definitions with the given VIDs in the given order.
    pub fn get_snp_markers(&self, vids: &[String]) -> Result<Vec<SnpMarker>> {
        markers::read_markers(&self.gateway, vids, self.params.batch_size)
    }
}

//-----------------------------------------------------------------------------

/// Genotype data objects.
impl KnowledgeBase {
    /// Creates the GDO repository for a markers set with `n` markers.
    pub fn create_gdo_repository(&self, set_vid: &str, n: usize) -> Result<()> {
        self.gdos.create_repository(&self.gateway, set_vid, n)
    }

    /// Appends a GDO to the repository of the markers set and returns its VID.
    pub fn append_gdo(&self, set_vid: &str, probs: &Array2<f32>, confs: &Array1<f32>, op_vid: &str) -> Result<String> {
        self.gdos.append(&self.gateway, set_vid, probs, confs, op_vid)
    }

    /// Returns the GDO with the given VID.
    pub fn get_gdo(&self, set_vid: &str, gdo_vid: &str) -> Result<Gdo> {
        self.gdos.get(&self.gateway, set_vid, gdo_vid)
    }

    /// Returns an iterator over the GDOs of the markers set.
    pub fn get_gdo_stream(&self, set_vid: &str, batch_size: usize) -> Result<GdoStream> {
        self.gdos.stream(&self.gateway, set_vid, batch_size)
    }

    /// Returns the number of GDOs stored for the markers set.
    pub fn gdo_count(&self, set_vid: &str) -> Result<usize> {
        self.gdos.count(&self.gateway, set_vid)
    }

    /// Removes the GDO repository of the markers set and returns `true` if it existed.
    pub fn drop_gdo_repository(&self, set_vid: &str) -> Result<bool> {
        self.gdos.drop_repository(&self.gateway, set_vid)
    }

    /// Saves a [`model::GENOTYPE_DATA_SAMPLE`] that points to a stored GDO.
    ///
    /// Fails if the GDO is not in the repository of the markers set.
    pub fn register_genotype_data_sample(
        &self, action: &Entity, label: &str, set_vid: &str, gdo_vid: &str, individual: Option<&Entity>
    ) -> Result<Entity> {
        self.get_gdo(set_vid, gdo_vid)?;
        let mut conf = Conf::new();
        conf.insert(String::from("action"), Value::reference(action));
        conf.insert(String::from("label"), Value::from(label));
        conf.insert(String::from("status"), Value::Enum(String::from("USABLE")));
        conf.insert(String::from("markers_set_vid"), Value::Vid(set_vid.to_string()));
        conf.insert(String::from("gdo_vid"), Value::Vid(gdo_vid.to_string()));
        if let Some(individual) = individual {
            conf.insert(String::from("individual"), Value::reference(individual));
        }
        let mut sample = self.new_entity(&model::GENOTYPE_DATA_SAMPLE, conf)?;
        self.save(&mut sample)?;
        Ok(sample)
    }

    /// Returns the GDOs of the genotype data samples in the same order.
    pub fn get_gdos_for_samples(&self, samples: &[Entity]) -> Result<Vec<Gdo>> {
        let mut result = Vec::with_capacity(samples.len());
        for sample in samples.iter() {
            if !sample.class().is_a(model::GENOTYPE_DATA_SAMPLE.name) {
                return Err(KBError::Validation(format!("{} {} is not a genotype data sample", sample.class(), sample.vid())));
            }
            let (set_vid, gdo_vid) = match (sample.get_str("markers_set_vid"), sample.get_str("gdo_vid")) {
                (Some(set_vid), Some(gdo_vid)) => (set_vid, gdo_vid),
                _ => return Err(KBError::Invariant(format!("genotype data sample {} has no GDO", sample.vid()))),
            };
            result.push(self.get_gdo(set_vid, gdo_vid)?);
        }
        Ok(result)
    }
}

//-----------------------------------------------------------------------------
