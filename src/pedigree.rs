//! Pedigree analysis for planning genotype imputation jobs.
//!
//! A family is a slice of [`Individual`]s linked by parent identifiers.
//! A parent that is not in the family is treated as unknown, so the same rules apply to a family and to any of its subfamilies.
//!
//! The cost of a family is its bit complexity `2 * |non-founders| - |founders| - |ungenotyped founder couples|`.
//! [`split`] breaks a family into overlapping subfamilies whose complexity fits a budget.

use crate::objects::{model, Entity, Value};
use crate::{KBError, Result};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::debug;


//-----------------------------------------------------------------------------

/// Sex of an individual.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sex {
    Male,
    Female,
    Unknown,
}

/// A member of a family.
pub trait Individual {
    /// Identifier of the individual, unique within the family.
    fn id(&self) -> &str;

    /// Identifier of the father, if known.
    fn father(&self) -> Option<&str>;

    /// Identifier of the mother, if known.
    fn mother(&self) -> Option<&str>;

    fn sex(&self) -> Sex;

    /// Has the individual been genotyped?
    fn genotyped(&self) -> bool;
}

/// A plain family member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub father: Option<String>,
    pub mother: Option<String>,
    pub sex: Sex,
    pub genotyped: bool,
}

impl Member {
    /// Creates a founder.
    pub fn founder(id: &str, sex: Sex, genotyped: bool) -> Self {
        Member { id: id.to_string(), father: None, mother: None, sex, genotyped }
    }

    /// Creates a child of the given parents.
    pub fn child(id: &str, father: &str, mother: &str, sex: Sex, genotyped: bool) -> Self {
        Member {
            id: id.to_string(),
            father: Some(father.to_string()),
            mother: Some(mother.to_string()),
            sex, genotyped,
        }
    }
}

impl Individual for Member {
    fn id(&self) -> &str {
        &self.id
    }

    fn father(&self) -> Option<&str> {
        self.father.as_deref()
    }

    fn mother(&self) -> Option<&str> {
        self.mother.as_deref()
    }

    fn sex(&self) -> Sex {
        self.sex
    }

    fn genotyped(&self) -> bool {
        self.genotyped
    }
}

/// Builds family members from stored individuals.
///
/// An individual is genotyped if its VID is in `genotyped`.
pub fn members_from_entities(individuals: &[Entity], genotyped: &HashSet<String>) -> Result<Vec<Member>> {
    let mut result = Vec::with_capacity(individuals.len());
    for individual in individuals.iter() {
        if !individual.class().is_a(model::INDIVIDUAL.name) {
            return Err(KBError::Validation(format!("{} {} is not an individual", individual.class(), individual.vid())));
        }
        let sex = match individual.get("gender") {
            Some(Value::Enum(gender)) if gender == "MALE" => Sex::Male,
            Some(Value::Enum(gender)) if gender == "FEMALE" => Sex::Female,
            _ => Sex::Unknown,
        };
        result.push(Member {
            id: individual.vid().to_string(),
            father: individual.get_ref("father").map(|x| x.vid.clone()),
            mother: individual.get_ref("mother").map(|x| x.vid.clone()),
            sex,
            genotyped: genotyped.contains(individual.vid()),
        });
    }
    Ok(result)
}

//-----------------------------------------------------------------------------

/// Founders, non-founders, couples, and children of a family.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Analysis {
    /// Individuals with no known parents.
    pub founders: BTreeSet<String>,
    /// Individuals with at least one known parent.
    pub non_founders: BTreeSet<String>,
    /// `(father, mother)` pairs of non-founders with both parents known.
    pub couples: BTreeSet<(String, String)>,
    /// Children of each parent.
    pub children: BTreeMap<String, BTreeSet<String>>,
}

// A family indexed by position.
struct Family<'a, I: Individual> {
    members: &'a [I],
    by_id: HashMap<&'a str, usize>,
}

impl<'a, I: Individual> Family<'a, I> {
    fn new(members: &'a [I]) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(members.len());
        for (i, member) in members.iter().enumerate() {
            if by_id.insert(member.id(), i).is_some() {
                return Err(KBError::Validation(format!("individual {} appears twice in the family", member.id())));
            }
        }
        Ok(Family { members, by_id })
    }

    fn all(&self) -> BTreeSet<usize> {
        (0..self.members.len()).collect()
    }

    fn father(&self, i: usize) -> Option<usize> {
        self.members[i].father().and_then(|x| self.by_id.get(x).copied())
    }

    fn mother(&self, i: usize) -> Option<usize> {
        self.members[i].mother().and_then(|x| self.by_id.get(x).copied())
    }

    fn parents(&self, i: usize) -> impl Iterator<Item = usize> {
        self.father(i).into_iter().chain(self.mother(i))
    }

    // Children of each member.
    fn children(&self) -> Vec<Vec<usize>> {
        let mut result = vec![Vec::new(); self.members.len()];
        for i in 0..self.members.len() {
            for parent in self.parents(i) {
                result[parent].push(i);
            }
        }
        result
    }

    // Parent indices of `i` within the subset.
    fn parents_in(&self, i: usize, subset: &BTreeSet<usize>) -> (Option<usize>, Option<usize>) {
        (
            self.father(i).filter(|x| subset.contains(x)),
            self.mother(i).filter(|x| subset.contains(x)),
        )
    }

    fn complexity(&self, subset: &BTreeSet<usize>) -> i64 {
        let mut founders = 0;
        let mut non_founders = 0;
        let mut couples: BTreeSet<(usize, usize)> = BTreeSet::new();
        for &i in subset.iter() {
            match self.parents_in(i, subset) {
                (None, None) => founders += 1,
                (Some(father), Some(mother)) => {
                    non_founders += 1;
                    couples.insert((father, mother));
                },
                _ => non_founders += 1,
            }
        }
        let ungenotyped_founder_couples = couples.iter().filter(|(father, mother)| {
            [*father, *mother].iter().all(|&x| {
                self.parents_in(x, subset) == (None, None) && !self.members[x].genotyped()
            })
        }).count();
        2 * non_founders - founders - ungenotyped_founder_couples as i64
    }

    fn select(&self, subset: &BTreeSet<usize>) -> Vec<&'a I> {
        let members = self.members;
        subset.iter().map(|&x| &members[x]).collect()
    }

    fn grow(&self, seeds: &BTreeSet<usize>, children: &[Vec<usize>], max_complexity: i64) -> BTreeSet<usize> {
        let mut current = seeds.clone();
        loop {
            let mut next = current.clone();
            for &i in current.iter() {
                next.extend(children[i].iter().copied());
            }
            let descendants: Vec<usize> = next.iter().copied().collect();
            for i in descendants {
                next.extend(self.parents(i));
            }
            if next.len() == current.len() || self.complexity(&next) > max_complexity {
                return current;
            }
            current = next;
        }
    }
}

//-----------------------------------------------------------------------------

/// Returns the founders, the non-founders, the couples, and the children of the family.
///
/// Fails if an identifier appears twice.
pub fn analyze<I: Individual>(family: &[I]) -> Result<Analysis> {
    let family = Family::new(family)?;
    let all = family.all();
    let mut result = Analysis::default();
    for i in 0..family.members.len() {
        let id = family.members[i].id().to_string();
        match family.parents_in(i, &all) {
            (None, None) => {
                result.founders.insert(id.clone());
            },
            (Some(father), Some(mother)) => {
                result.non_founders.insert(id.clone());
                result.couples.insert((family.members[father].id().to_string(), family.members[mother].id().to_string()));
            },
            _ => {
                result.non_founders.insert(id.clone());
            },
        }
        for parent in family.parents(i) {
            result.children.entry(family.members[parent].id().to_string()).or_default().insert(id.clone());
        }
    }
    Ok(result)
}

/// Returns the bit complexity of the family.
///
/// # Examples
///
/// ```
/// use genokb::pedigree::{self, Member, Sex};
///
/// let family = vec![
///     Member::founder("father", Sex::Male, false),
///     Member::founder("mother", Sex::Female, false),
///     Member::child("child", "father", "mother", Sex::Female, true),
/// ];
/// // 2 * 1 - 2 - 1
/// assert_eq!(pedigree::bit_complexity(&family).unwrap(), -1);
/// ```
pub fn bit_complexity<I: Individual>(family: &[I]) -> Result<i64> {
    let family = Family::new(family)?;
    Ok(family.complexity(&family.all()))
}

/// Grows a subfamily from the seeds.
///
/// Each round adds the children of the current members and then the parents of the resulting set.
/// Growth stops when a round adds nobody or when the subfamily after the round would exceed `max_complexity`.
/// The seeds are always included.
pub fn grow<'a, I: Individual>(family: &'a [I], seeds: &[&str], max_complexity: i64) -> Result<Vec<&'a I>> {
    let family = Family::new(family)?;
    let mut start = BTreeSet::new();
    for seed in seeds.iter() {
        let i = family.by_id.get(*seed).copied().ok_or_else(|| {
            KBError::NotFound(format!("seed {} is not in the family", seed))
        })?;
        start.insert(i);
    }
    let children = family.children();
    let grown = family.grow(&start, &children, max_complexity);
    Ok(family.select(&grown))
}

fn components<I: Individual>(family: &Family<I>, children: &[Vec<usize>]) -> Vec<BTreeSet<usize>> {
    let mut component = vec![usize::MAX; family.members.len()];
    let mut result: Vec<BTreeSet<usize>> = Vec::new();
    for start in 0..family.members.len() {
        if component[start] != usize::MAX {
            continue;
        }
        let id = result.len();
        let mut members = BTreeSet::new();
        let mut stack = vec![start];
        component[start] = id;
        while let Some(i) = stack.pop() {
            members.insert(i);
            for next in family.parents(i).chain(children[i].iter().copied()) {
                if component[next] == usize::MAX {
                    component[next] = id;
                    stack.push(next);
                }
            }
        }
        result.push(members);
    }
    result
}

/// Splits the family into connected components.
pub fn split_disjoint<I: Individual>(family: &[I]) -> Result<Vec<Vec<&I>>> {
    let family = Family::new(family)?;
    let children = family.children();
    Ok(components(&family, &children).iter().map(|x| family.select(x)).collect())
}

/// Splits the family into subfamilies with bit complexity at most `max_complexity`.
///
/// A family that fits is returned as is.
/// Otherwise each connected component that does not fit is covered by subfamilies grown from its couples,
/// and then from any individual not covered yet.
/// Subfamilies contained in other subfamilies are dropped.
/// A subfamily may exceed the budget only if its seed alone does.
pub fn split<I: Individual>(family: &[I], max_complexity: i64) -> Result<Vec<Vec<&I>>> {
    let family = Family::new(family)?;
    let all = family.all();
    if family.complexity(&all) <= max_complexity {
        return Ok(vec![family.select(&all)]);
    }

    let children = family.children();
    let mut subfamilies: Vec<BTreeSet<usize>> = Vec::new();
    for component in components(&family, &children) {
        if family.complexity(&component) <= max_complexity {
            subfamilies.push(component);
            continue;
        }

        let mut seeds: BTreeSet<BTreeSet<usize>> = BTreeSet::new();
        for &i in component.iter() {
            if let (Some(father), Some(mother)) = family.parents_in(i, &component) {
                seeds.insert([father, mother].into_iter().collect());
            }
        }
        let mut grown: Vec<BTreeSet<usize>> = seeds.iter().map(|x| family.grow(x, &children, max_complexity)).collect();

        let mut covered: BTreeSet<usize> = grown.iter().flatten().copied().collect();
        for &i in component.iter() {
            if !covered.contains(&i) {
                let subfamily = family.grow(&BTreeSet::from([i]), &children, max_complexity);
                covered.extend(subfamily.iter().copied());
                grown.push(subfamily);
            }
        }
        debug!("Split a component of {} individuals into {} candidate subfamilies", component.len(), grown.len());
        subfamilies.extend(grown);
    }

    // Keep the largest subfamilies first and drop those contained in a kept one.
    subfamilies.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let mut kept: Vec<BTreeSet<usize>> = Vec::new();
    for subfamily in subfamilies {
        if !kept.iter().any(|x| subfamily.is_subset(x)) {
            kept.push(subfamily);
        }
    }
    Ok(kept.iter().map(|x| family.select(x)).collect())
}

/// Returns the identifiers of the individuals.
pub fn ids<I: Individual>(family: &[&I]) -> BTreeSet<String> {
    family.iter().map(|x| x.id().to_string()).collect()
}

//-----------------------------------------------------------------------------
