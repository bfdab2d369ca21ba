use crate::routing::Token;

/// A continuous hash ring. Members are sorted by token; lookups walk the
/// ring in the direction of increasing tokens, wrapping around after the
/// highest one. The driver uses it to find the replicas owning a token.
#[derive(Debug, Clone)]
pub struct TokenRing<ElemT> {
    ring: Vec<(Token, ElemT)>,
}

impl<ElemT> TokenRing<ElemT> {
    pub(crate) const fn new_empty() -> TokenRing<ElemT> {
        Self { ring: Vec::new() }
    }

    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, ElemT)>) -> TokenRing<ElemT> {
        let mut ring: Vec<(Token, ElemT)> = ring_iter.collect();
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        TokenRing { ring }
    }

    /// Iterates over all members of the ring starting at the lowest token.
    pub fn iter(&self) -> impl Iterator<Item = &(Token, ElemT)> {
        self.ring.iter()
    }

    /// Iterator over (token, member) pairs starting at the given token,
    /// traversing the whole ring once with wrap-around.
    pub fn ring_range_full(&self, token: Token) -> impl Iterator<Item = &(Token, ElemT)> {
        let binary_search_index: usize = match self.ring.binary_search_by(|e| e.0.cmp(&token)) {
            Ok(exact_match_index) => exact_match_index,
            Err(first_greater_index) => first_greater_index,
        };

        self.ring[binary_search_index..]
            .iter()
            .chain(self.ring.iter())
            .take(self.ring.len())
    }

    /// Like [Self::ring_range_full], but yields members only.
    pub fn ring_range(&self, token: Token) -> impl Iterator<Item = &ElemT> {
        self.ring_range_full(token).map(|(_t, e)| e)
    }

    /// The first member at or after the given token.
    pub fn get_elem_for_token(&self, token: Token) -> Option<&ElemT> {
        self.ring_range(token).next()
    }

    /// Index of the ring segment owning the given token; segment `i` covers
    /// the range `(ring[i-1].token, ring[i].token]`, the first segment also
    /// owns everything past the last token.
    pub(crate) fn segment_index(&self, token: Token) -> Option<usize> {
        if self.ring.is_empty() {
            return None;
        }
        match self.ring.binary_search_by(|e| e.0.cmp(&token)) {
            Ok(i) => Some(i),
            Err(i) if i == self.ring.len() => Some(0),
            Err(i) => Some(i),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::TokenRing;
    use crate::routing::Token;

    #[test]
    fn token_ring_range_walks() {
        let ring_data = [
            (Token::new(-30), -3),
            (Token::new(-20), -2),
            (Token::new(-10), -1),
            (Token::new(0), 0),
            (Token::new(10), 1),
            (Token::new(20), 2),
            (Token::new(30), 3),
        ];

        let ring: TokenRing<i32> = TokenRing::new(ring_data.into_iter());

        let range = |t: i64| -> Vec<i32> { ring.ring_range(Token::new(t)).cloned().collect() };

        assert_eq!(range(-35), vec![-3, -2, -1, 0, 1, 2, 3]);
        assert_eq!(range(-30), vec![-3, -2, -1, 0, 1, 2, 3]);
        assert_eq!(range(-25), vec![-2, -1, 0, 1, 2, 3, -3]);
        assert_eq!(range(-5), vec![0, 1, 2, 3, -3, -2, -1]);
        assert_eq!(range(0), vec![0, 1, 2, 3, -3, -2, -1]);
        assert_eq!(range(15), vec![2, 3, -3, -2, -1, 0, 1]);
        assert_eq!(range(30), vec![3, -3, -2, -1, 0, 1, 2]);
        assert_eq!(range(35), vec![-3, -2, -1, 0, 1, 2, 3]);
    }

    #[test]
    fn token_ring_segment_index() {
        let ring: TokenRing<char> = TokenRing::new(
            [
                (Token::new(10), 'a'),
                (Token::new(20), 'b'),
                (Token::new(30), 'c'),
            ]
            .into_iter(),
        );

        assert_eq!(ring.segment_index(Token::new(5)), Some(0));
        assert_eq!(ring.segment_index(Token::new(10)), Some(0));
        assert_eq!(ring.segment_index(Token::new(11)), Some(1));
        assert_eq!(ring.segment_index(Token::new(30)), Some(2));
        assert_eq!(ring.segment_index(Token::new(31)), Some(0));

        let empty: TokenRing<char> = TokenRing::new_empty();
        assert_eq!(empty.segment_index(Token::new(0)), None);
    }
}
