// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod item;
mod parser;
mod token;

pub use item::{Channel, Enclosure, FeedItem, parse_date};
pub use parser::{FeedParser, ParseState};
pub use token::{BodyReader, LexError, Token, TokenSource, XmlTokenSource};
