macro_rules! set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident(IndexSet<$element:ty, DefaultHashBuilder>);
    ) => {
        $(#[$meta])*
        pub struct $name(IndexSet<$element, DefaultHashBuilder>);

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            #[doc = concat!("Creates an empty [`", stringify!($name), "`].")]
            #[must_use]
            #[inline]
            pub fn new() -> Self {
                Self(IndexSet::with_hasher(DefaultHashBuilder::default()))
            }

            #[doc = concat!(
                "Creates a [`", stringify!($name), "`] containing a single element."
            )]
            #[must_use]
            #[inline]
            pub fn init(element: $element) -> Self {
                Self::new().insert(element)
            }

            #[doc = "Inserts an element while constructing the collection."]
            #[must_use]
            #[inline]
            pub fn insert(mut self, element: $element) -> Self {
                self.add(element);
                self
            }

            #[doc = "Adds an element."]
            #[inline]
            pub fn add(&mut self, element: $element) {
                let _ = self.0.insert(element);
            }

            #[doc = "Checks whether the given element is contained."]
            #[must_use]
            #[inline]
            pub fn contains(&self, element: &$element) -> bool {
                self.0.contains(element)
            }

            #[doc = "Returns the number of elements."]
            #[must_use]
            #[inline]
            pub fn len(&self) -> usize {
                self.0.len()
            }

            #[doc = "Checks whether the collection is empty."]
            #[must_use]
            #[inline]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            #[doc = "Returns an iterator over the elements."]
            #[inline]
            pub fn iter(&self) -> indexmap::set::Iter<'_, $element> {
                self.0.iter()
            }
        }

        impl IntoIterator for $name {
            type Item = $element;
            type IntoIter = indexmap::set::IntoIter<$element>;

            fn into_iter(self) -> Self::IntoIter {
                self.0.into_iter()
            }
        }

        impl<'a> IntoIterator for &'a $name {
            type Item = &'a $element;
            type IntoIter = indexmap::set::Iter<'a, $element>;

            fn into_iter(self) -> Self::IntoIter {
                self.0.iter()
            }
        }
    };
}

pub(crate) use set;
