//! Example event schema shared by tests and demos.
//!
//! The messages mirror `polybus/example.proto`:
//!
//! ```proto
//! syntax = "proto3";
//! package polybus.example;
//!
//! message Person {
//!   int32 id = 1;
//!   string name = 2;
//!   repeated string emails = 3;
//!   repeated PhoneNumber phones = 4;
//!   int64 last_updated = 5;
//!
//!   enum PhoneType { MOBILE = 0; HOME = 1; WORK = 2; }
//!   message PhoneNumber { string number = 1; PhoneType type = 2; }
//! }
//!
//! message AddressBook { repeated Person people = 1; }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

const PACKAGE: &str = "polybus.example";

/// A person in the address book.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Person {
    /// Unique identifier.
    #[prost(int32, tag = "1")]
    pub id: i32,

    /// Display name.
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,

    /// Email addresses.
    #[prost(string, repeated, tag = "3")]
    pub emails: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,

    /// Phone numbers.
    #[prost(message, repeated, tag = "4")]
    pub phones: ::prost::alloc::vec::Vec<person::PhoneNumber>,

    /// Last update as UNIX seconds.
    #[prost(int64, tag = "5")]
    pub last_updated: i64,
}

/// Nested message and enum types in `Person`.
pub mod person {
    /// A phone number with its kind.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PhoneNumber {
        /// The number itself.
        #[prost(string, tag = "1")]
        pub number: ::prost::alloc::string::String,

        /// Kind of number.
        #[prost(enumeration = "PhoneType", tag = "2")]
        pub r#type: i32,
    }

    /// Kind of phone number.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum PhoneType {
        /// Mobile phone.
        Mobile = 0,
        /// Home phone.
        Home = 1,
        /// Work phone.
        Work = 2,
    }
}

/// A collection of people.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddressBook {
    /// Everyone in the book.
    #[prost(message, repeated, tag = "1")]
    pub people: ::prost::alloc::vec::Vec<Person>,
}

impl ::prost::Name for Person {
    const NAME: &'static str = "Person";
    const PACKAGE: &'static str = PACKAGE;

    fn full_name() -> ::prost::alloc::string::String {
        "polybus.example.Person".into()
    }

    fn type_url() -> ::prost::alloc::string::String {
        "/polybus.example.Person".into()
    }
}

impl ::prost::Name for AddressBook {
    const NAME: &'static str = "AddressBook";
    const PACKAGE: &'static str = PACKAGE;

    fn full_name() -> ::prost::alloc::string::String {
        "polybus.example.AddressBook".into()
    }

    fn type_url() -> ::prost::alloc::string::String {
        "/polybus.example.AddressBook".into()
    }
}
