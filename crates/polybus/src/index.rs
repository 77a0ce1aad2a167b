use std::collections::HashMap;
use std::collections::hash_map::{Entry, Iter};
use std::sync::Arc;

use tracing::debug;

use crate::consumer::{Descriptors, EventConsumer};
use crate::descriptor::ConsumerDescriptor;
use crate::error::{Error, Result};

/// Routing table from wire type name to the descriptor that handles it.
#[derive(Clone, Debug, Default)]
pub struct ConsumerIndex {
    index: HashMap<String, ConsumerDescriptor>,
}

impl ConsumerIndex {
    /// Builds the index from every registered consumer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateEventType`] if two descriptors, from the same
    /// consumer or from different ones, claim the same event type.
    pub fn new<I>(consumers: I) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<dyn EventConsumer>>,
    {
        let mut index = HashMap::new();

        for consumer in consumers {
            let mut descriptors = Descriptors::new();

            consumer.describe(&mut descriptors);

            for descriptor in descriptors.into_inner() {
                match index.entry(descriptor.event_type().to_string()) {
                    Entry::Occupied(entry) => {
                        return Err(Error::DuplicateEventType {
                            event_type: entry.key().clone(),
                        });
                    }
                    Entry::Vacant(entry) => {
                        debug!("Registered consumer for {}", entry.key());
                        entry.insert(descriptor);
                    }
                }
            }
        }

        Ok(Self { index })
    }

    /// Returns the descriptor for an event type.
    #[must_use]
    pub fn get(&self, event_type: &str) -> Option<&ConsumerDescriptor> {
        self.index.get(event_type)
    }

    /// Whether an event type has a consumer.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.index.contains_key(event_type)
    }

    /// All event types with a consumer.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Iterates over `(event type, descriptor)` pairs.
    pub fn iter(&self) -> Iter<'_, String, ConsumerDescriptor> {
        self.index.iter()
    }

    /// Number of event types with a consumer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no consumer was registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl<'a> IntoIterator for &'a ConsumerIndex {
    type Item = (&'a String, &'a ConsumerDescriptor);
    type IntoIter = Iter<'a, String, ConsumerDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use bytes::Bytes;
    use polybus_example::{AddressBook, Person};
    use prost::Message;
    use tokio_util::sync::CancellationToken;

    use crate::{ConsumeEvent, Event, Outcome};

    #[derive(Default)]
    struct Directory {
        people: Mutex<Vec<Person>>,
        books: Mutex<Vec<AddressBook>>,
    }

    impl EventConsumer for Directory {
        fn describe(self: Arc<Self>, descriptors: &mut Descriptors) {
            descriptors
                .add::<Person, _>(&self)
                .add::<AddressBook, _>(&self);
        }
    }

    #[async_trait]
    impl ConsumeEvent<Person> for Directory {
        async fn consume_event(&self, event: Person, _: CancellationToken) -> Outcome {
            self.people.lock().unwrap().push(event);
            Outcome::Success
        }
    }

    #[async_trait]
    impl ConsumeEvent<AddressBook> for Directory {
        async fn consume_event(&self, event: AddressBook, _: CancellationToken) -> Outcome {
            self.books.lock().unwrap().push(event);
            Outcome::Failure
        }
    }

    struct Greeter;

    impl EventConsumer for Greeter {
        fn describe(self: Arc<Self>, descriptors: &mut Descriptors) {
            descriptors.add::<Person, _>(&self);
        }
    }

    #[async_trait]
    impl ConsumeEvent<Person> for Greeter {
        async fn consume_event(&self, _: Person, cancellation: CancellationToken) -> Outcome {
            if cancellation.is_cancelled() {
                Outcome::Failure
            } else {
                Outcome::Success
            }
        }
    }

    #[test]
    fn test_index_every_declared_type() {
        let directory = Arc::new(Directory::default());
        let index = ConsumerIndex::new([directory.clone() as Arc<dyn EventConsumer>]).unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.contains(&Person::type_name()));
        assert!(index.contains(&AddressBook::type_name()));

        for (event_type, descriptor) in &index {
            assert_eq!(event_type, descriptor.event_type());
            assert_eq!(
                Arc::as_ptr(descriptor.instance()).cast::<()>(),
                Arc::as_ptr(&directory).cast::<()>()
            );
        }
    }

    #[test]
    fn test_empty_index() {
        let index = ConsumerIndex::new(std::iter::empty()).unwrap();

        assert!(index.is_empty());
        assert!(index.get("polybus.example.Person").is_none());
    }

    #[test]
    fn test_duplicate_type_across_consumers() {
        let result = ConsumerIndex::new([
            Arc::new(Directory::default()) as Arc<dyn EventConsumer>,
            Arc::new(Greeter) as Arc<dyn EventConsumer>,
        ]);

        assert_matches!(
            result,
            Err(Error::DuplicateEventType { event_type }) if event_type == Person::type_name()
        );
    }

    #[test]
    fn test_duplicate_type_within_consumer() {
        struct Twice;

        impl EventConsumer for Twice {
            fn describe(self: Arc<Self>, descriptors: &mut Descriptors) {
                descriptors.add::<Person, _>(&self).add::<Person, _>(&self);
            }
        }

        #[async_trait]
        impl ConsumeEvent<Person> for Twice {
            async fn consume_event(&self, _: Person, _: CancellationToken) -> Outcome {
                Outcome::Success
            }
        }

        let result = ConsumerIndex::new([Arc::new(Twice) as Arc<dyn EventConsumer>]);

        assert_matches!(result, Err(Error::DuplicateEventType { .. }));
    }

    #[tokio::test]
    async fn test_descriptor_routes_to_matching_handler() {
        let directory = Arc::new(Directory::default());
        let index = ConsumerIndex::new([directory.clone() as Arc<dyn EventConsumer>]).unwrap();
        let person = Person {
            id: 1,
            name: "John Doe".to_string(),
            ..Person::default()
        };

        let descriptor = index.get(&Person::type_name()).unwrap();
        let event = descriptor
            .decode(Bytes::from(person.encode_to_vec()))
            .unwrap();
        let outcome = descriptor.execute(event, CancellationToken::new()).await;

        assert!(outcome.is_success());
        assert_eq!(*directory.people.lock().unwrap(), vec![person]);
        assert!(directory.books.lock().unwrap().is_empty());

        let descriptor = index.get(&AddressBook::type_name()).unwrap();
        let event = descriptor.decode(Bytes::new()).unwrap();
        let outcome = descriptor.execute(event, CancellationToken::new()).await;

        assert_matches!(outcome, Outcome::Failure);
        assert_eq!(directory.books.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_descriptor_passes_cancellation() {
        let index = ConsumerIndex::new([Arc::new(Greeter) as Arc<dyn EventConsumer>]).unwrap();
        let descriptor = index.get(&Person::type_name()).unwrap();
        let cancellation = CancellationToken::new();

        cancellation.cancel();

        let event = descriptor.decode(Bytes::new()).unwrap();

        assert_matches!(
            descriptor.execute(event, cancellation).await,
            Outcome::Failure
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let index = ConsumerIndex::new([Arc::new(Greeter) as Arc<dyn EventConsumer>]).unwrap();
        let descriptor = index.get(&Person::type_name()).unwrap();

        assert_matches!(
            descriptor.decode(Bytes::from_static(&[0xff, 0xff, 0xff])),
            Err(Error::Decode { .. })
        );
    }

    #[tokio::test]
    async fn test_execute_with_foreign_event() {
        let index = ConsumerIndex::new([Arc::new(Directory::default()) as Arc<dyn EventConsumer>])
            .unwrap();
        let person = index.get(&Person::type_name()).unwrap();
        let book = index.get(&AddressBook::type_name()).unwrap();

        let event = book.decode(Bytes::new()).unwrap();

        assert_matches!(
            person.execute(event, CancellationToken::new()).await,
            Outcome::Error(_)
        );
    }
}
