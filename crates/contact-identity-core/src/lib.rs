use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("integrity error: {0}")]
    Integrity(String),
}

/// Store-assigned contact identifier. Ids are handed out in creation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<i64>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Contact {
    /// Resolve the primary this contact belongs to: itself when primary, its link otherwise.
    ///
    /// # Errors
    /// Returns [`IdentityError::Integrity`] when a secondary contact carries no link.
    pub fn anchor_id(&self) -> Result<ContactId, IdentityError> {
        match self.link_precedence {
            LinkPrecedence::Primary => Ok(self.id),
            LinkPrecedence::Secondary => self.linked_id.ok_or_else(|| {
                IdentityError::Integrity(format!(
                    "secondary contact {} has no linked primary",
                    self.id
                ))
            }),
        }
    }

    /// Check the per-row invariants every stored contact must satisfy.
    ///
    /// # Errors
    /// Returns [`IdentityError::Integrity`] when the row has no identifying attribute
    /// or when its precedence and link disagree.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.email.is_none() && self.phone_number.is_none() {
            return Err(IdentityError::Integrity(format!(
                "contact {} has neither email nor phone number",
                self.id
            )));
        }

        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Primary, Some(linked_id)) => Err(IdentityError::Integrity(format!(
                "primary contact {} MUST NOT link to {linked_id}",
                self.id
            ))),
            (LinkPrecedence::Secondary, None) => Err(IdentityError::Integrity(format!(
                "secondary contact {} MUST link to a primary",
                self.id
            ))),
            (LinkPrecedence::Secondary, Some(linked_id)) if linked_id == self.id => {
                Err(IdentityError::Integrity(format!("contact {} links to itself", self.id)))
            }
            _ => Ok(()),
        }
    }
}

/// A validated partial identity: at least one of email or phone number is present.
#[derive(Debug, Clone, Serialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    email: Option<String>,
    phone_number: Option<i64>,
}

impl Identity {
    /// Build an identity from raw request attributes. Emails are trimmed and an
    /// empty email counts as absent.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when neither attribute is present.
    pub fn new(email: Option<String>, phone_number: Option<i64>) -> Result<Self, IdentityError> {
        let email = email.map(|value| value.trim().to_string()).filter(|value| !value.is_empty());
        if email.is_none() && phone_number.is_none() {
            return Err(IdentityError::Validation(
                "at least one of email or phoneNumber MUST be provided".to_string(),
            ));
        }
        Ok(Self { email, phone_number })
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<i64> {
        self.phone_number
    }
}

/// Union of the identifying data found for a request, anchored on one primary.
///
/// Built from the matched rows only. When a request bridges several primaries the
/// view is partial: it is anchored on the earliest primary, lists matched
/// secondaries of every bridged cluster, and omits the other primaries' ids.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedView {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<i64>,
    pub secondary_contact_ids: Vec<ContactId>,
}

impl ConsolidatedView {
    fn for_new_primary(primary_contact_id: ContactId, identity: &Identity) -> Self {
        Self {
            primary_contact_id,
            emails: identity.email.iter().cloned().collect(),
            phone_numbers: identity.phone_number.into_iter().collect(),
            secondary_contact_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "link_precedence", rename_all = "snake_case")]
pub enum CreateInstruction {
    Primary { email: Option<String>, phone_number: Option<i64> },
    Secondary { email: Option<String>, phone_number: Option<i64>, primary_id: ContactId },
}

impl CreateInstruction {
    #[must_use]
    pub fn link_precedence(&self) -> LinkPrecedence {
        match self {
            Self::Primary { .. } => LinkPrecedence::Primary,
            Self::Secondary { .. } => LinkPrecedence::Secondary,
        }
    }
}

/// Outcome of [`consolidate`]: the view built so far plus what, if anything, must be created.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Consolidation {
    NewCluster { identity: Identity, instruction: CreateInstruction },
    Existing {
        view: ConsolidatedView,
        instruction: Option<CreateInstruction>,
        bridged_primaries: Vec<ContactId>,
    },
}

impl Consolidation {
    #[must_use]
    pub fn instruction(&self) -> Option<&CreateInstruction> {
        match self {
            Self::NewCluster { instruction, .. } => Some(instruction),
            Self::Existing { instruction, .. } => instruction.as_ref(),
        }
    }

    /// Other primaries reached by the same match set. Non-empty means the request
    /// bridged several clusters; they are reported, never merged.
    #[must_use]
    pub fn bridged_primaries(&self) -> &[ContactId] {
        match self {
            Self::NewCluster { .. } => &[],
            Self::Existing { bridged_primaries, .. } => bridged_primaries,
        }
    }

    /// Complete the view once the instruction (if any) has been executed.
    ///
    /// # Errors
    /// Returns [`IdentityError::Integrity`] when `created` does not agree with the
    /// instruction: an id is missing for an instruction, or present without one.
    pub fn into_view(self, created: Option<ContactId>) -> Result<ConsolidatedView, IdentityError> {
        match (self, created) {
            (Self::NewCluster { identity, .. }, Some(id)) => {
                Ok(ConsolidatedView::for_new_primary(id, &identity))
            }
            (Self::Existing { mut view, instruction: Some(_), .. }, Some(id)) => {
                view.secondary_contact_ids.push(id);
                Ok(view)
            }
            (Self::Existing { view, instruction: None, .. }, None) => Ok(view),
            (Self::Existing { instruction: None, .. }, Some(id)) => Err(IdentityError::Integrity(
                format!("contact {id} was created without a create instruction"),
            )),
            (_, None) => Err(IdentityError::Integrity(
                "create instruction was not executed; no contact id available".to_string(),
            )),
        }
    }
}

/// Reduce optional values to their distinct present values in first-seen order.
#[must_use]
pub fn unique_ordered<T, I>(values: I) -> Vec<T>
where
    T: Eq + Hash + Clone,
    I: IntoIterator<Item = Option<T>>,
{
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for value in values.into_iter().flatten() {
        if seen.insert(value.clone()) {
            unique.push(value);
        }
    }
    unique
}

/// Canonical primary for a match set: the earliest-created anchor across all rows,
/// together with any other anchors the rows point at.
///
/// # Errors
/// Returns [`IdentityError::Integrity`] when a secondary row has no link, and
/// [`IdentityError::Validation`] for an empty match set.
pub fn resolve_primary_id(
    matches: &[Contact],
) -> Result<(ContactId, Vec<ContactId>), IdentityError> {
    let anchors = matches.iter().map(Contact::anchor_id).collect::<Result<Vec<_>, _>>()?;
    let mut anchors = unique_ordered(anchors.into_iter().map(Some));
    anchors.sort_unstable();

    let mut anchors = anchors.into_iter();
    let Some(primary) = anchors.next() else {
        return Err(IdentityError::Validation(
            "cannot resolve a primary from an empty match set".to_string(),
        ));
    };
    Ok((primary, anchors.collect()))
}

/// Literal novelty rule: the submitted identity is new only when its email is not
/// already consolidated AND its phone number is not already consolidated. An absent
/// attribute counts as "not consolidated".
#[must_use]
pub fn is_novel(identity: &Identity, view: &ConsolidatedView) -> bool {
    let email_known =
        identity.email().is_some_and(|email| view.emails.iter().any(|known| known == email));
    let phone_known =
        identity.phone_number().is_some_and(|phone| view.phone_numbers.contains(&phone));
    !email_known && !phone_known
}

/// Decide what a request resolves to given the contacts that matched it.
///
/// # Errors
/// Returns [`IdentityError::Integrity`] when a matched row violates the
/// secondary-must-link invariant.
pub fn consolidate(identity: &Identity, matches: &[Contact]) -> Result<Consolidation, IdentityError> {
    if matches.is_empty() {
        return Ok(Consolidation::NewCluster {
            identity: identity.clone(),
            instruction: CreateInstruction::Primary {
                email: identity.email.clone(),
                phone_number: identity.phone_number,
            },
        });
    }

    let (primary_contact_id, bridged_primaries) = resolve_primary_id(matches)?;

    let view = ConsolidatedView {
        primary_contact_id,
        emails: unique_ordered(matches.iter().map(|contact| contact.email.clone())),
        phone_numbers: unique_ordered(matches.iter().map(|contact| contact.phone_number)),
        secondary_contact_ids: unique_ordered(matches.iter().map(|contact| {
            (contact.link_precedence == LinkPrecedence::Secondary).then_some(contact.id)
        })),
    };

    let instruction = is_novel(identity, &view).then(|| CreateInstruction::Secondary {
        email: identity.email.clone(),
        phone_number: identity.phone_number,
        primary_id: primary_contact_id,
    });

    Ok(Consolidation::Existing { view, instruction, bridged_primaries })
}

/// Narrow query/insert contract the engine needs from a contact store.
pub trait ContactGateway {
    type Error;

    /// Every stored contact whose email equals the identity's email OR whose phone
    /// number equals the identity's phone number, in creation order.
    ///
    /// # Errors
    /// Returns the store error when the lookup fails.
    fn find_matches(&mut self, identity: &Identity) -> Result<Vec<Contact>, Self::Error>;

    /// # Errors
    /// Returns the store error when the insert fails.
    fn insert_primary(
        &mut self,
        email: Option<&str>,
        phone_number: Option<i64>,
    ) -> Result<ContactId, Self::Error>;

    /// # Errors
    /// Returns the store error when the insert fails or `primary_id` is not a primary.
    fn insert_secondary(
        &mut self,
        email: Option<&str>,
        phone_number: Option<i64>,
        primary_id: ContactId,
    ) -> Result<ContactId, Self::Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError<E> {
    #[error("contact store unavailable: {0}")]
    Unavailable(E),
    #[error("contact lookup failed: {0}")]
    Lookup(E),
    #[error("contact insert failed: {0}")]
    Insert(E),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatedContact {
    pub id: ContactId,
    pub link_precedence: LinkPrecedence,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub view: ConsolidatedView,
    pub matched: usize,
    pub created: Option<CreatedContact>,
    pub bridged_primaries: Vec<ContactId>,
}

/// Run one request through the gateway: find matches, consolidate, execute the
/// create instruction if one was emitted, and complete the view.
///
/// # Errors
/// Returns [`ResolveError::Lookup`] or [`ResolveError::Insert`] for gateway failures
/// and [`ResolveError::Identity`] when stored rows break the cluster invariants.
pub fn resolve_identity<G>(
    gateway: &mut G,
    identity: &Identity,
) -> Result<Resolution, ResolveError<G::Error>>
where
    G: ContactGateway,
{
    let matches = gateway.find_matches(identity).map_err(ResolveError::Lookup)?;
    let consolidation = consolidate(identity, &matches)?;

    let created = match consolidation.instruction() {
        None => None,
        Some(instruction) => {
            let id = match instruction {
                CreateInstruction::Primary { email, phone_number } => {
                    gateway.insert_primary(email.as_deref(), *phone_number)
                }
                CreateInstruction::Secondary { email, phone_number, primary_id } => {
                    gateway.insert_secondary(email.as_deref(), *phone_number, *primary_id)
                }
            }
            .map_err(ResolveError::Insert)?;
            Some(CreatedContact { id, link_precedence: instruction.link_precedence() })
        }
    };

    let bridged_primaries = consolidation.bridged_primaries().to_vec();
    let view = consolidation.into_view(created.map(|contact| contact.id))?;

    Ok(Resolution { view, matched: matches.len(), created, bridged_primaries })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use time::Duration;

    fn fixture_time(offset: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + offset)
    }

    fn mk_contact(
        id: i64,
        email: Option<&str>,
        phone_number: Option<i64>,
        linked_id: Option<i64>,
    ) -> Contact {
        Contact {
            id: ContactId(id),
            email: email.map(str::to_string),
            phone_number,
            link_precedence: if linked_id.is_some() {
                LinkPrecedence::Secondary
            } else {
                LinkPrecedence::Primary
            },
            linked_id: linked_id.map(ContactId),
            created_at: fixture_time(id),
        }
    }

    fn identity(email: Option<&str>, phone_number: Option<i64>) -> Identity {
        match Identity::new(email.map(str::to_string), phone_number) {
            Ok(identity) => identity,
            Err(err) => panic!("invalid fixture identity: {err}"),
        }
    }

    /// Gateway over a plain vector, mirroring the SQL OR-match.
    #[derive(Debug, Default)]
    struct MemoryGateway {
        contacts: Vec<Contact>,
        inserts: usize,
    }

    impl MemoryGateway {
        fn insert(
            &mut self,
            email: Option<&str>,
            phone_number: Option<i64>,
            linked_id: Option<ContactId>,
        ) -> ContactId {
            let id = i64::try_from(self.contacts.len()).unwrap_or(i64::MAX) + 1;
            self.contacts.push(mk_contact(id, email, phone_number, linked_id.map(|link| link.0)));
            self.inserts += 1;
            ContactId(id)
        }
    }

    impl ContactGateway for MemoryGateway {
        type Error = String;

        fn find_matches(&mut self, identity: &Identity) -> Result<Vec<Contact>, Self::Error> {
            Ok(self
                .contacts
                .iter()
                .filter(|contact| {
                    (identity.email().is_some() && contact.email.as_deref() == identity.email())
                        || (identity.phone_number().is_some()
                            && contact.phone_number == identity.phone_number())
                })
                .cloned()
                .collect())
        }

        fn insert_primary(
            &mut self,
            email: Option<&str>,
            phone_number: Option<i64>,
        ) -> Result<ContactId, Self::Error> {
            Ok(self.insert(email, phone_number, None))
        }

        fn insert_secondary(
            &mut self,
            email: Option<&str>,
            phone_number: Option<i64>,
            primary_id: ContactId,
        ) -> Result<ContactId, Self::Error> {
            let is_primary = self.contacts.iter().any(|contact| {
                contact.id == primary_id && contact.link_precedence == LinkPrecedence::Primary
            });
            if !is_primary {
                return Err(format!("contact {primary_id} is not a primary"));
            }
            Ok(self.insert(email, phone_number, Some(primary_id)))
        }
    }

    struct FailingGateway;

    impl ContactGateway for FailingGateway {
        type Error = String;

        fn find_matches(&mut self, _identity: &Identity) -> Result<Vec<Contact>, Self::Error> {
            Ok(Vec::new())
        }

        fn insert_primary(
            &mut self,
            _email: Option<&str>,
            _phone_number: Option<i64>,
        ) -> Result<ContactId, Self::Error> {
            Err("disk full".to_string())
        }

        fn insert_secondary(
            &mut self,
            _email: Option<&str>,
            _phone_number: Option<i64>,
            _primary_id: ContactId,
        ) -> Result<ContactId, Self::Error> {
            Err("disk full".to_string())
        }
    }

    #[test]
    fn unique_ordered_skips_absent_and_keeps_first_seen_order() {
        let emails = vec![
            Some("a@x.com".to_string()),
            None,
            Some("a@x.com".to_string()),
            Some("b@x.com".to_string()),
        ];
        assert_eq!(unique_ordered(emails), vec!["a@x.com".to_string(), "b@x.com".to_string()]);
    }

    #[test]
    fn unique_ordered_is_total_on_empty_input() {
        let phones: Vec<Option<i64>> = Vec::new();
        assert!(unique_ordered(phones).is_empty());
        assert!(unique_ordered(vec![None::<i64>, None]).is_empty());
    }

    #[test]
    fn identity_requires_at_least_one_attribute() {
        let err = match Identity::new(Some("   ".to_string()), None) {
            Ok(identity) => panic!("expected validation error, got {identity:?}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("at least one of email or phoneNumber"));

        let trimmed = identity(Some("  doc@hillvalley.edu "), None);
        assert_eq!(trimmed.email(), Some("doc@hillvalley.edu"));
        assert_eq!(trimmed.phone_number(), None);
    }

    #[test]
    fn contact_validate_rejects_broken_links() {
        let mut orphan = mk_contact(2, Some("a@x.com"), None, Some(1));
        orphan.linked_id = None;
        assert!(orphan.validate().is_err());
        assert!(orphan.anchor_id().is_err());

        let mut linked_primary = mk_contact(1, Some("a@x.com"), None, None);
        linked_primary.linked_id = Some(ContactId(3));
        assert!(linked_primary.validate().is_err());

        let empty = mk_contact(4, None, None, None);
        assert!(empty.validate().is_err());

        assert_eq!(mk_contact(5, None, Some(555), Some(1)).validate(), Ok(()));
    }

    #[test]
    fn new_identity_creates_primary_with_submitted_values() -> Result<(), ResolveError<String>> {
        let mut gateway = MemoryGateway::default();
        let resolution =
            resolve_identity(&mut gateway, &identity(Some("lorraine@hillvalley.edu"), Some(123_456)))?;

        assert_eq!(
            resolution.view,
            ConsolidatedView {
                primary_contact_id: ContactId(1),
                emails: vec!["lorraine@hillvalley.edu".to_string()],
                phone_numbers: vec![123_456],
                secondary_contact_ids: vec![],
            }
        );
        assert_eq!(
            resolution.created,
            Some(CreatedContact { id: ContactId(1), link_precedence: LinkPrecedence::Primary })
        );
        assert_eq!(gateway.contacts.len(), 1);
        Ok(())
    }

    #[test]
    fn new_identity_with_only_phone_has_no_email_entry() -> Result<(), ResolveError<String>> {
        let mut gateway = MemoryGateway::default();
        let resolution = resolve_identity(&mut gateway, &identity(None, Some(555)))?;

        assert!(resolution.view.emails.is_empty());
        assert_eq!(resolution.view.phone_numbers, vec![555]);
        Ok(())
    }

    #[test]
    fn exact_duplicate_of_single_primary_creates_nothing() -> Result<(), ResolveError<String>> {
        let mut gateway = MemoryGateway::default();
        let request = identity(Some("marty@hillvalley.edu"), Some(1985));
        let _first = resolve_identity(&mut gateway, &request)?;
        let second = resolve_identity(&mut gateway, &request)?;

        assert_eq!(second.created, None);
        assert_eq!(second.view.emails, vec!["marty@hillvalley.edu".to_string()]);
        assert_eq!(second.view.phone_numbers, vec![1985]);
        assert!(second.view.secondary_contact_ids.is_empty());
        assert_eq!(gateway.inserts, 1);
        Ok(())
    }

    #[test]
    fn phone_only_request_matches_every_row_sharing_the_phone() -> Result<(), String> {
        let mut gateway = MemoryGateway::default();
        gateway.contacts.push(mk_contact(1, Some("a@x.com"), Some(555), None));
        gateway.contacts.push(mk_contact(2, Some("b@x.com"), Some(555), Some(1)));
        gateway.contacts.push(mk_contact(3, Some("c@x.com"), Some(777), None));

        let matches = gateway.find_matches(&identity(None, Some(555)))?;
        let ids = matches.iter().map(|contact| contact.id.0).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn matching_request_emits_no_instruction() -> Result<(), IdentityError> {
        let matches = vec![
            mk_contact(1, Some("a@x.com"), Some(555), None),
            mk_contact(2, Some("b@x.com"), Some(555), Some(1)),
        ];
        // New email, known phone: the literal rule still treats it as not novel.
        let consolidation = consolidate(&identity(Some("new@x.com"), Some(555)), &matches)?;

        assert_eq!(consolidation.instruction(), None);
        let view = consolidation.into_view(None)?;
        assert_eq!(view.primary_contact_id, ContactId(1));
        assert_eq!(view.emails, vec!["a@x.com".to_string(), "b@x.com".to_string()]);
        assert_eq!(view.phone_numbers, vec![555]);
        assert_eq!(view.secondary_contact_ids, vec![ContactId(2)]);
        Ok(())
    }

    #[test]
    fn primary_resolution_does_not_trust_first_row() -> Result<(), IdentityError> {
        let primary_first = vec![
            mk_contact(1, Some("a@x.com"), None, None),
            mk_contact(2, Some("a@x.com"), Some(9), Some(1)),
        ];
        assert_eq!(resolve_primary_id(&primary_first)?, (ContactId(1), vec![]));

        let secondary_first = vec![
            mk_contact(4, Some("z@x.com"), Some(10), Some(3)),
            mk_contact(5, None, Some(10), Some(3)),
        ];
        assert_eq!(resolve_primary_id(&secondary_first)?, (ContactId(3), vec![]));
        Ok(())
    }

    #[test]
    fn bridged_clusters_resolve_to_earliest_primary_and_are_reported() -> Result<(), IdentityError> {
        let matches = vec![
            mk_contact(7, Some("doc@x.com"), Some(1), None),
            mk_contact(8, Some("doc@x.com"), Some(2), Some(7)),
            mk_contact(3, Some("emmett@x.com"), Some(88), None),
        ];
        let consolidation = consolidate(&identity(Some("doc@x.com"), Some(88)), &matches)?;

        assert_eq!(consolidation.bridged_primaries(), &[ContactId(7)]);
        let view = consolidation.into_view(None)?;
        assert_eq!(view.primary_contact_id, ContactId(3));
        assert_eq!(view.secondary_contact_ids, vec![ContactId(8)]);
        assert_eq!(view.emails, vec!["doc@x.com".to_string(), "emmett@x.com".to_string()]);
        assert!(!view.secondary_contact_ids.contains(&ContactId(7)));
        Ok(())
    }

    #[test]
    fn secondary_without_link_is_an_integrity_error() {
        let mut orphan = mk_contact(2, Some("a@x.com"), None, Some(1));
        orphan.linked_id = None;

        let result = consolidate(&identity(Some("a@x.com"), None), &[orphan]);
        assert!(matches!(result, Err(IdentityError::Integrity(_))));
    }

    #[test]
    fn novel_identity_against_foreign_match_set_creates_secondary() -> Result<(), IdentityError> {
        let matches = vec![mk_contact(1, Some("a@x.com"), Some(555), None)];
        let consolidation = consolidate(&identity(Some("b@x.com"), Some(777)), &matches)?;

        assert_eq!(
            consolidation.instruction(),
            Some(&CreateInstruction::Secondary {
                email: Some("b@x.com".to_string()),
                phone_number: Some(777),
                primary_id: ContactId(1),
            })
        );
        let view = consolidation.into_view(Some(ContactId(2)))?;
        assert_eq!(view.secondary_contact_ids, vec![ContactId(2)]);
        Ok(())
    }

    /// Gateway whose match set is fixed, regardless of the request.
    struct FixedMatchGateway {
        matches: Vec<Contact>,
        fail_inserts: bool,
        secondaries: Vec<(Option<String>, Option<i64>, ContactId)>,
    }

    impl FixedMatchGateway {
        fn new(matches: Vec<Contact>, fail_inserts: bool) -> Self {
            Self { matches, fail_inserts, secondaries: Vec::new() }
        }
    }

    impl ContactGateway for FixedMatchGateway {
        type Error = String;

        fn find_matches(&mut self, _identity: &Identity) -> Result<Vec<Contact>, Self::Error> {
            Ok(self.matches.clone())
        }

        fn insert_primary(
            &mut self,
            _email: Option<&str>,
            _phone_number: Option<i64>,
        ) -> Result<ContactId, Self::Error> {
            Err("fixed match set never needs a primary".to_string())
        }

        fn insert_secondary(
            &mut self,
            email: Option<&str>,
            phone_number: Option<i64>,
            primary_id: ContactId,
        ) -> Result<ContactId, Self::Error> {
            if self.fail_inserts {
                return Err("disk full".to_string());
            }
            self.secondaries.push((email.map(str::to_string), phone_number, primary_id));
            let next = self.matches.iter().map(|contact| contact.id.0).max().unwrap_or(0) + 1;
            Ok(ContactId(next))
        }
    }

    #[test]
    fn driver_inserts_secondary_for_novel_identity() -> Result<(), ResolveError<String>> {
        let mut gateway = FixedMatchGateway::new(
            vec![mk_contact(1, Some("a@x.com"), Some(555), None)],
            false,
        );

        let resolution = resolve_identity(&mut gateway, &identity(Some("b@x.com"), Some(777)))?;

        assert_eq!(
            resolution.created,
            Some(CreatedContact { id: ContactId(2), link_precedence: LinkPrecedence::Secondary })
        );
        assert_eq!(resolution.matched, 1);
        assert_eq!(resolution.view.primary_contact_id, ContactId(1));
        assert_eq!(resolution.view.secondary_contact_ids, vec![ContactId(2)]);
        assert_eq!(resolution.view.emails, vec!["a@x.com".to_string()]);
        assert_eq!(
            gateway.secondaries,
            vec![(Some("b@x.com".to_string()), Some(777), ContactId(1))]
        );
        Ok(())
    }

    #[test]
    fn failed_secondary_insert_surfaces_as_insert_error() {
        let mut gateway = FixedMatchGateway::new(
            vec![mk_contact(1, Some("a@x.com"), Some(555), None)],
            true,
        );

        match resolve_identity(&mut gateway, &identity(Some("b@x.com"), Some(777))) {
            Err(ResolveError::Insert(message)) => assert_eq!(message, "disk full"),
            other => panic!("expected insert error, got {other:?}"),
        }
        assert!(gateway.secondaries.is_empty());
    }

    #[test]
    fn instruction_reports_its_link_precedence() {
        let primary = CreateInstruction::Primary { email: None, phone_number: Some(1) };
        let secondary = CreateInstruction::Secondary {
            email: None,
            phone_number: Some(1),
            primary_id: ContactId(1),
        };
        assert_eq!(primary.link_precedence(), LinkPrecedence::Primary);
        assert_eq!(secondary.link_precedence(), LinkPrecedence::Secondary);
    }

    #[test]
    fn is_novel_counts_absent_attributes_as_unknown() {
        let view = ConsolidatedView {
            primary_contact_id: ContactId(1),
            emails: vec!["a@x.com".to_string()],
            phone_numbers: vec![5],
            secondary_contact_ids: vec![],
        };
        assert!(is_novel(&identity(Some("b@x.com"), None), &view));
        assert!(is_novel(&identity(None, Some(6)), &view));
        assert!(!is_novel(&identity(Some("a@x.com"), Some(6)), &view));
        assert!(!is_novel(&identity(Some("b@x.com"), Some(5)), &view));
    }

    #[test]
    fn into_view_rejects_mismatched_creation() {
        let new_cluster = Consolidation::NewCluster {
            identity: identity(Some("a@x.com"), None),
            instruction: CreateInstruction::Primary {
                email: Some("a@x.com".to_string()),
                phone_number: None,
            },
        };
        assert!(new_cluster.into_view(None).is_err());

        let existing = Consolidation::Existing {
            view: ConsolidatedView {
                primary_contact_id: ContactId(1),
                emails: vec![],
                phone_numbers: vec![1],
                secondary_contact_ids: vec![],
            },
            instruction: None,
            bridged_primaries: vec![],
        };
        assert!(existing.into_view(Some(ContactId(9))).is_err());
    }

    #[test]
    fn insert_failure_surfaces_as_insert_error() {
        let result = resolve_identity(&mut FailingGateway, &identity(Some("a@x.com"), None));
        match result {
            Err(ResolveError::Insert(message)) => assert_eq!(message, "disk full"),
            other => panic!("expected insert error, got {other:?}"),
        }
    }

    #[test]
    fn resolution_never_mutates_existing_contacts() -> Result<(), ResolveError<String>> {
        let mut gateway = MemoryGateway::default();
        let requests = [
            (Some("a@x.com"), Some(1)),
            (Some("a@x.com"), Some(2)),
            (None, Some(2)),
            (Some("b@x.com"), None),
        ];
        for (email, phone) in requests {
            let before = gateway.contacts.clone();
            let _ = resolve_identity(&mut gateway, &identity(email, phone))?;
            assert_eq!(&gateway.contacts[..before.len()], before.as_slice());
        }
        Ok(())
    }

    #[test]
    fn consolidated_view_serializes_with_camel_case_keys() {
        let view = ConsolidatedView {
            primary_contact_id: ContactId(1),
            emails: vec!["lorraine@hillvalley.edu".to_string()],
            phone_numbers: vec![123_456],
            secondary_contact_ids: vec![ContactId(23)],
        };
        let json = match serde_json::to_value(&view) {
            Ok(json) => json,
            Err(err) => panic!("view should serialize: {err}"),
        };
        assert_eq!(
            json,
            serde_json::json!({
                "primaryContactId": 1,
                "emails": ["lorraine@hillvalley.edu"],
                "phoneNumbers": [123_456],
                "secondaryContactIds": [23]
            })
        );
    }

    proptest! {
        #[test]
        fn property_unique_ordered_matches_first_occurrences(values in proptest::collection::vec(proptest::option::of(0_i64..8), 0..40)) {
            let unique = unique_ordered(values.clone());

            let mut expected = Vec::new();
            for value in values.iter().flatten() {
                if !expected.contains(value) {
                    expected.push(*value);
                }
            }
            prop_assert_eq!(unique, expected);
        }
    }

    proptest! {
        #[test]
        fn property_view_only_contains_matched_values(phones in proptest::collection::vec(proptest::option::of(0_i64..5), 1..20)) {
            let matches = phones
                .iter()
                .enumerate()
                .map(|(index, phone)| {
                    let id = i64::try_from(index).unwrap_or(i64::MAX) + 1;
                    let linked = if id == 1 { None } else { Some(1) };
                    mk_contact(id, Some("shared@x.com"), *phone, linked)
                })
                .collect::<Vec<_>>();

            let consolidation = consolidate(&identity(Some("shared@x.com"), None), &matches);
            prop_assert!(consolidation.is_ok());
            let consolidation = consolidation.unwrap_or_else(|_| unreachable!());
            prop_assert!(consolidation.instruction().is_none());

            let view = consolidation.into_view(None).unwrap_or_else(|_| unreachable!());
            prop_assert_eq!(view.primary_contact_id, ContactId(1));
            prop_assert_eq!(view.emails, vec!["shared@x.com".to_string()]);
            prop_assert!(view.phone_numbers.iter().all(|phone| phones.contains(&Some(*phone))));
            prop_assert_eq!(view.secondary_contact_ids.len(), matches.len() - 1);
        }
    }
}
