//src/genetic_code.rs

/// NCBI translation tables in the compact 64-letter form, codons ordered
/// TTT, TTC, TTA, TTG, TCT, ... GGG (bases in T, C, A, G order).
const TABLES: &[(u8, &[u8; 64])] = &[
    (1, b"FFLLSSSSYY**CC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG"),
    (2, b"FFLLSSSSYY**CCWWLLLLPPPPHHQQRRRRIIMMTTTTNNKKSS**VVVVAAAADDEEGGGG"),
    (3, b"FFLLSSSSYY**CCWWTTTTPPPPHHQQRRRRIIMMTTTTNNKKSSRRVVVVAAAADDEEGGGG"),
    (4, b"FFLLSSSSYY**CCWWLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG"),
    (5, b"FFLLSSSSYY**CCWWLLLLPPPPHHQQRRRRIIMMTTTTNNKKSSSSVVVVAAAADDEEGGGG"),
    (6, b"FFLLSSSSYYQQCC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG"),
    (9, b"FFLLSSSSYY**CCWWLLLLPPPPHHQQRRRRIIIMTTTTNNNKSSSSVVVVAAAADDEEGGGG"),
    (10, b"FFLLSSSSYY**CCCWLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG"),
    (11, b"FFLLSSSSYY**CC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG"),
    (12, b"FFLLSSSSYY**CC*WLLLSPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG"),
    (13, b"FFLLSSSSYY**CCWWLLLLPPPPHHQQRRRRIIMMTTTTNNKKSSGGVVVVAAAADDEEGGGG"),
    (14, b"FFLLSSSSYYY*CCWWLLLLPPPPHHQQRRRRIIIMTTTTNNNKSSSSVVVVAAAADDEEGGGG"),
    (16, b"FFLLSSSSYY*LCC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG"),
    (21, b"FFLLSSSSYY**CCWWLLLLPPPPHHQQRRRRIIMMTTTTNNNKSSSSVVVVAAAADDEEGGGG"),
    (22, b"FFLLSS*SYY*LCC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG"),
    (23, b"FF*LSSSSYY**CC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG"),
    (24, b"FFLLSSSSYY**CCWWLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSSKVVVVAAAADDEEGGGG"),
    (25, b"FFLLSSSSYY**CCGWLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG"),
];

/// A codon-to-amino-acid table.
#[derive(Debug, Clone, Copy)]
pub struct GeneticCode {
    pub id: u8,
    amino_acids: &'static [u8; 64],
}

pub fn table(id: u8) -> Option<GeneticCode> {
    TABLES
        .iter()
        .find(|(n, _)| *n == id)
        .map(|&(id, amino_acids)| GeneticCode { id, amino_acids })
}

#[inline]
fn base_index(b: u8) -> Option<usize> {
    match b {
        b'T' | b't' | b'U' | b'u' => Some(0),
        b'C' | b'c' => Some(1),
        b'A' | b'a' => Some(2),
        b'G' | b'g' => Some(3),
        _ => None,
    }
}

impl GeneticCode {
    /// Amino acid for one codon; `X` when the codon holds an ambiguous base.
    #[inline]
    pub fn translate_codon(&self, codon: &[u8]) -> u8 {
        match (base_index(codon[0]), base_index(codon[1]), base_index(codon[2])) {
            (Some(a), Some(b), Some(c)) => self.amino_acids[a * 16 + b * 4 + c],
            _ => b'X',
        }
    }

    /// Translates `seq` from `offset`, dropping the trailing partial codon.
    pub fn translate_frame(&self, seq: &[u8], offset: usize) -> String {
        seq.get(offset..)
            .unwrap_or_default()
            .chunks_exact(3)
            .map(|codon| self.translate_codon(codon) as char)
            .collect()
    }

    /// Number of stop codons in the frame starting at `offset`.
    pub fn count_stops(&self, seq: &[u8], offset: usize) -> usize {
        seq.get(offset..)
            .unwrap_or_default()
            .chunks_exact(3)
            .filter(|codon| self.translate_codon(codon) == b'*')
            .count()
    }
}
